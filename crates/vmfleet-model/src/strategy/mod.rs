mod retry;
pub use retry::RetryStrategy;
