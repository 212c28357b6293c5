use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use vmfleet_model::{
    DeployTarget, FleetConfig, ImageDescriptor, InstanceStatus, ProviderInstance, ProviderState,
    SourceHash, TAG_PROFILE_ID, TAG_SOURCE_HASH, Tags, USER_DATA_AGENT_NAME, USER_DATA_IMAGE_ID,
    USER_DATA_PROFILE_ID, UserData,
};

use super::*;
use crate::{
    connector::{ConnectorError, MockConnector, MockOp},
    metrics::testing::RecordingMetrics,
    retry::{RetryPolicy, Sleeper},
};

struct NoSleep;

#[async_trait]
impl Sleeper for NoSleep {
    async fn sleep(&self, _: u64) {}
}

#[derive(Default)]
struct RecordingListener {
    terminated: Mutex<Vec<(String, InstanceStatus)>>,
    transitions: Mutex<Vec<(String, InstanceStatus, InstanceStatus)>>,
}

#[async_trait]
impl InstanceListener for RecordingListener {
    fn name(&self) -> &str {
        "recording"
    }

    async fn instance_terminated(&self, instance: &InstanceHandle) {
        self.terminated
            .lock()
            .unwrap()
            .push((instance.name().to_string(), instance.status()));
    }

    async fn status_changed(&self, instance: &InstanceHandle, from: InstanceStatus, to: InstanceStatus) {
        self.transitions
            .lock()
            .unwrap()
            .push((instance.name().to_string(), from, to));
    }
}

fn image(max_instances: u32, reuse_stopped: bool) -> ImageDescriptor {
    ImageDescriptor {
        source_id: "linux-agents".into(),
        target: DeployTarget::Image {
            image_id: "/images/agent-2024".into(),
        },
        region: "westeurope".into(),
        network_id: "build-net".into(),
        subnet_id: "agents".into(),
        max_instances,
        name_prefix: "Agent-".into(),
        vm_size: "Standard_D2s_v3".into(),
        reuse_stopped,
        os_type: None,
        tags: Tags::new(),
        identity: None,
    }
}

fn fast_retry() -> RetryPolicy<ConnectorError> {
    RetryPolicy::new()
        .max_retries(2)
        .retry_if(ConnectorError::is_transient)
        .sleeper(Arc::new(NoSleep))
}

fn fleet(image: ImageDescriptor, connector: &Arc<MockConnector>) -> Arc<FleetController> {
    Arc::new(
        FleetController::builder(image, connector.clone())
            .with_config(FleetConfig {
                profile_id: "cp-7".into(),
                ..FleetConfig::default()
            })
            .with_retry_policy(fast_retry())
            .build()
            .unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_get_exactly_the_first_n_names() {
    let connector = Arc::new(MockConnector::new().with_latency(Duration::from_millis(5)));
    let fleet = fleet(image(8, false), &connector);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let fleet = fleet.clone();
            tokio::spawn(async move { fleet.start_new_instance(UserData::new()).await })
        })
        .collect();

    let mut names = Vec::new();
    for h in handles {
        names.push(h.await.unwrap().unwrap().name().to_string());
    }
    names.sort_by_key(|n| n.trim_start_matches("agent-").parse::<u32>().unwrap());

    let expected: Vec<_> = (1..=8).map(|i| format!("agent-{i}")).collect();
    assert_eq!(names, expected);
    assert_eq!(fleet.capacity_used(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_past_capacity_are_rejected() {
    let connector = Arc::new(MockConnector::new().with_latency(Duration::from_millis(5)));
    let fleet = fleet(image(8, false), &connector);

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let fleet = fleet.clone();
            tokio::spawn(async move { fleet.start_new_instance(UserData::new()).await })
        })
        .collect();

    let mut names = Vec::new();
    let mut rejected = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(inst) => names.push(inst.name().to_string()),
            Err(err) => {
                assert!(err.is_capacity(), "unexpected error: {err}");
                rejected += 1;
            }
        }
    }
    names.sort_by_key(|n| n.trim_start_matches("agent-").parse::<u32>().unwrap());

    let expected: Vec<_> = (1..=8).map(|i| format!("agent-{i}")).collect();
    assert_eq!(names, expected);
    assert_eq!(rejected, 4);
    assert_eq!(connector.calls_of(MockOp::Create).len(), 8);
    assert_eq!(fleet.capacity_used(), 8);
}

#[tokio::test]
async fn start_beyond_capacity_allocates_nothing() {
    let connector = Arc::new(MockConnector::new());
    let metrics = Arc::new(RecordingMetrics::default());
    let fleet = FleetController::builder(image(2, false), connector.clone())
        .with_metrics(metrics.clone())
        .with_retry_policy(fast_retry())
        .build()
        .unwrap();

    fleet.start_new_instance(UserData::new()).await.unwrap();
    fleet.start_new_instance(UserData::new()).await.unwrap();
    let err = fleet.start_new_instance(UserData::new()).await.unwrap_err();

    assert!(err.is_capacity(), "unexpected error: {err}");
    assert_eq!(fleet.instances().len(), 2);
    assert_eq!(connector.calls_of(MockOp::Create).len(), 2);
    assert_eq!(*metrics.rejections.lock().unwrap(), vec!["linux-agents".to_string()]);
}

#[tokio::test]
async fn reuse_reclaims_the_same_name() {
    let connector = Arc::new(MockConnector::new());
    let fleet = fleet(image(1, true), &connector);

    let first = fleet.start_new_instance(UserData::new()).await.unwrap();
    fleet.terminate_instance(&first).await.unwrap();

    assert_eq!(first.status(), InstanceStatus::Stopped);
    assert_eq!(connector.provider_state("agent-1"), Some(ProviderState::Stopped));
    assert_eq!(fleet.capacity_used(), 0);

    let second = fleet.start_new_instance(UserData::new()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.status(), InstanceStatus::Running);
    assert_eq!(connector.calls_of(MockOp::Create), vec!["agent-1"]);
    assert_eq!(connector.calls_of(MockOp::Start), vec!["agent-1"]);
}

#[tokio::test]
async fn without_reuse_a_higher_index_is_allocated() {
    let connector = Arc::new(MockConnector::new());
    let fleet = fleet(image(1, false), &connector);

    let first = fleet.start_new_instance(UserData::new()).await.unwrap();
    fleet.terminate_instance(&first).await.unwrap();

    assert_eq!(first.status(), InstanceStatus::Terminated);
    assert!(fleet.instances().is_empty());
    assert_eq!(connector.provider_state("agent-1"), None);

    let second = fleet.start_new_instance(UserData::new()).await.unwrap();
    assert_eq!(second.name(), "agent-2");
}

#[tokio::test]
async fn failed_provisioning_leaves_error_and_holds_capacity() {
    let connector = Arc::new(MockConnector::new());
    connector.fail_next(MockOp::Create, ConnectorError::Rejected("quota".into()));
    let fleet = fleet(image(1, false), &connector);

    let err = fleet.start_new_instance(UserData::new()).await.unwrap_err();
    assert!(matches!(err, FleetError::Provider { ref instance, .. } if instance == "agent-1"));

    let slot = fleet.instance("agent-1").unwrap();
    assert_eq!(slot.status(), InstanceStatus::Error);
    assert_eq!(slot.last_error().as_deref(), Some("request rejected: quota"));
    assert_eq!(fleet.capacity_used(), 1);

    let err = fleet.start_new_instance(UserData::new()).await.unwrap_err();
    assert!(err.is_capacity());
}

#[tokio::test]
async fn slot_of_a_rejected_create_can_be_cleaned_up() {
    for reuse in [false, true] {
        let connector = Arc::new(MockConnector::new());
        connector.fail_next(MockOp::Create, ConnectorError::Rejected("quota".into()));
        let fleet = fleet(image(1, reuse), &connector);
        let listener = Arc::new(RecordingListener::default());
        fleet.subscribe(listener.clone());

        fleet.start_new_instance(UserData::new()).await.unwrap_err();
        let slot = fleet.instance("agent-1").unwrap();
        assert!(!slot.is_provisioned());

        fleet.terminate_instance(&slot).await.unwrap();

        assert_eq!(slot.status(), InstanceStatus::Terminated);
        assert_eq!(fleet.capacity_used(), 0);
        assert!(fleet.instance("agent-1").is_none());
        assert_eq!(connector.calls_of(MockOp::Delete), vec!["agent-1"]);
        assert!(connector.calls_of(MockOp::Stop).is_empty());
        assert_eq!(listener.terminated.lock().unwrap().len(), 1);

        let next = fleet.start_new_instance(UserData::new()).await.unwrap();
        assert_eq!(next.name(), "agent-2");
    }
}

#[tokio::test]
async fn instance_gone_at_the_provider_counts_as_terminated() {
    let connector = Arc::new(MockConnector::new());
    let fleet = fleet(image(1, true), &connector);

    let inst = fleet.start_new_instance(UserData::new()).await.unwrap();
    connector.fail_next(MockOp::Stop, ConnectorError::NotFound("agent-1".into()));

    fleet.terminate_instance(&inst).await.unwrap();

    assert_eq!(inst.status(), InstanceStatus::Terminated);
    assert!(fleet.instances().is_empty());
    assert_eq!(fleet.capacity_used(), 0);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let connector = Arc::new(MockConnector::new());
    connector.fail_times(MockOp::Create, 2, ConnectorError::Transient("503".into()));
    let metrics = Arc::new(RecordingMetrics::default());
    let fleet = FleetController::builder(image(1, false), connector.clone())
        .with_metrics(metrics.clone())
        .with_retry_policy(fast_retry())
        .build()
        .unwrap();

    let inst = fleet.start_new_instance(UserData::new()).await.unwrap();

    assert_eq!(inst.status(), InstanceStatus::Running);
    assert_eq!(connector.calls_of(MockOp::Create).len(), 3);
    assert_eq!(metrics.retries.lock().unwrap().len(), 2);
    assert_eq!(
        *metrics.calls.lock().unwrap(),
        vec![("create".to_string(), CallOutcome::Success)]
    );
}

#[tokio::test]
async fn provision_spec_carries_identity_user_data_and_tags() {
    let connector = Arc::new(MockConnector::new());
    let fleet = fleet(image(1, false), &connector);

    let user_data = UserData::new()
        .with("SERVER_URL", "https://ci.example.org")
        .with(USER_DATA_AGENT_NAME, "spoofed");
    fleet.start_new_instance(user_data).await.unwrap();

    let spec = connector.spec_of("agent-1").unwrap();
    assert_eq!(spec.user_data.get("SERVER_URL"), Some("https://ci.example.org"));
    assert_eq!(spec.user_data.get(USER_DATA_AGENT_NAME), Some("agent-1"));
    assert_eq!(spec.user_data.get(USER_DATA_PROFILE_ID), Some("cp-7"));
    assert_eq!(spec.user_data.get(USER_DATA_IMAGE_ID), Some("linux-agents"));
    assert_eq!(spec.tags.get(TAG_PROFILE_ID), Some("cp-7"));
    assert_eq!(
        spec.tags.get(TAG_SOURCE_HASH),
        Some(fleet.source_hash().as_str())
    );
}

#[tokio::test]
async fn profile_user_data_is_overridden_by_start_user_data() {
    let connector = Arc::new(MockConnector::new());
    let fleet = FleetController::builder(image(1, false), connector.clone())
        .with_config(FleetConfig {
            user_data: UserData::new()
                .with("POOL", "shared")
                .with("SERVER_URL", "https://ci.example.org"),
            ..FleetConfig::default()
        })
        .build()
        .unwrap();

    fleet
        .start_new_instance(UserData::new().with("POOL", "release"))
        .await
        .unwrap();

    let spec = connector.spec_of("agent-1").unwrap();
    assert_eq!(spec.user_data.get("POOL"), Some("release"));
    assert_eq!(spec.user_data.get("SERVER_URL"), Some("https://ci.example.org"));
    assert_eq!(spec.user_data.get(USER_DATA_PROFILE_ID), Some("default"));
}

#[tokio::test]
async fn listener_hears_terminate_once_after_the_transition() {
    let connector = Arc::new(MockConnector::new());
    let fleet = fleet(image(2, false), &connector);
    let listener = Arc::new(RecordingListener::default());
    fleet.subscribe(listener.clone());

    let inst = fleet.start_new_instance(UserData::new()).await.unwrap();
    fleet.terminate_instance(&inst).await.unwrap();

    let err = fleet.terminate_instance(&inst).await.unwrap_err();
    assert!(matches!(err, FleetError::UnknownInstance(_)), "unexpected error: {err}");

    assert_eq!(
        *listener.terminated.lock().unwrap(),
        vec![("agent-1".to_string(), InstanceStatus::Terminated)]
    );

    use InstanceStatus::*;
    let transitions: Vec<_> = listener
        .transitions
        .lock()
        .unwrap()
        .iter()
        .map(|(_, from, to)| (*from, *to))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (Idle, Starting),
            (Starting, Running),
            (Running, Stopping),
            (Stopping, Terminated)
        ]
    );
}

#[tokio::test]
async fn failed_terminate_reports_error_without_notifying() {
    let connector = Arc::new(MockConnector::new());
    let fleet = fleet(image(1, true), &connector);
    let listener = Arc::new(RecordingListener::default());
    fleet.subscribe(listener.clone());

    let inst = fleet.start_new_instance(UserData::new()).await.unwrap();
    connector.fail_next(MockOp::Stop, ConnectorError::Rejected("locked".into()));

    let err = fleet.terminate_instance(&inst).await.unwrap_err();
    assert!(matches!(err, FleetError::Provider { .. }));
    assert_eq!(inst.status(), InstanceStatus::Error);
    assert!(listener.terminated.lock().unwrap().is_empty());

    fleet.terminate_instance(&inst).await.unwrap();
    assert_eq!(inst.status(), InstanceStatus::Stopped);
    assert_eq!(listener.terminated.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn stopped_instances_cannot_be_terminated_again() {
    let connector = Arc::new(MockConnector::new());
    let fleet = fleet(image(1, true), &connector);

    let inst = fleet.start_new_instance(UserData::new()).await.unwrap();
    fleet.terminate_instance(&inst).await.unwrap();

    let err = fleet.terminate_instance(&inst).await.unwrap_err();
    assert!(matches!(
        err,
        FleetError::InvalidState {
            status: InstanceStatus::Stopped,
            ..
        }
    ));
}

#[tokio::test]
async fn terminate_waits_for_an_in_flight_start() {
    let connector = Arc::new(
        MockConnector::new().with_latency_for("agent-1", Duration::from_millis(30)),
    );
    let fleet = fleet(image(1, false), &connector);

    let pending = fleet
        .launch_new_instance(UserData::new(), CancellationToken::new())
        .unwrap();
    let inst = pending.instance().clone();
    assert_eq!(inst.status(), InstanceStatus::Starting);

    fleet.terminate_instance(&inst).await.unwrap();

    assert_eq!(inst.status(), InstanceStatus::Terminated);
    assert_eq!(connector.calls_of(MockOp::Create), vec!["agent-1"]);
    assert_eq!(connector.calls_of(MockOp::Delete), vec!["agent-1"]);
    assert!(pending.wait().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn dropped_start_leaves_the_slot_in_error() {
    let connector = Arc::new(MockConnector::new().with_latency(Duration::from_secs(10)));
    let fleet = fleet(image(1, false), &connector);

    let res = tokio::time::timeout(
        Duration::from_millis(10),
        fleet.start_new_instance(UserData::new()),
    )
    .await;
    assert!(res.is_err());

    let slot = fleet.instance("agent-1").unwrap();
    assert_eq!(slot.status(), InstanceStatus::Error);
    assert_eq!(slot.last_error().as_deref(), Some("provisioning abandoned"));
    assert_eq!(fleet.capacity_used(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_launch_keeps_the_slot_claimed() {
    let connector = Arc::new(MockConnector::new().with_latency(Duration::from_secs(10)));
    let fleet = fleet(image(1, false), &connector);
    let cancel = CancellationToken::new();

    let listener = Arc::new(RecordingListener::default());
    fleet.subscribe(listener.clone());

    let pending = fleet
        .launch_new_instance(UserData::new(), cancel.clone())
        .unwrap();
    let inst = pending.instance().clone();

    tokio::time::sleep(Duration::from_millis(5)).await;
    cancel.cancel();

    let err = pending.wait().await.unwrap_err();
    assert!(matches!(err, FleetError::Cancelled { .. }));
    assert_eq!(inst.status(), InstanceStatus::Error);
    assert_eq!(inst.last_error().as_deref(), Some("provisioning cancelled"));

    // The error transition is delivered from a spawned task.
    tokio::time::sleep(Duration::from_millis(1)).await;
    use InstanceStatus::*;
    let transitions: Vec<_> = listener
        .transitions
        .lock()
        .unwrap()
        .iter()
        .map(|(_, from, to)| (*from, *to))
        .collect();
    assert_eq!(transitions, vec![(Idle, Starting), (Starting, Error)]);
    assert!(
        fleet
            .launch_new_instance(UserData::new(), CancellationToken::new())
            .unwrap_err()
            .is_capacity()
    );
}

#[tokio::test]
async fn reconcile_adopts_provider_instances_and_bumps_the_index() {
    let connector = Arc::new(MockConnector::new());
    let fleet = fleet(image(4, true), &connector);
    let current = fleet.source_hash().clone();

    connector.insert_instance(
        "agent-3",
        ProviderInstance::new(ProviderState::Running).with_source_hash(current.clone()),
    );
    connector.insert_instance(
        "agent-5",
        ProviderInstance::new(ProviderState::Stopped)
            .with_source_hash(SourceHash::new("sha256:outdated")),
    );
    connector.insert_instance("agent-7", ProviderInstance::new(ProviderState::Deleting));
    connector.insert_instance("agent-07", ProviderInstance::new(ProviderState::Running));
    connector.insert_instance("other-1", ProviderInstance::new(ProviderState::Running));

    assert_eq!(fleet.reconcile().await.unwrap(), 2);
    assert_eq!(fleet.reconcile().await.unwrap(), 0);
    assert_eq!(connector.fetch_count(), 1);

    let names: Vec<_> = fleet.instances().iter().map(|i| i.name().to_string()).collect();
    assert_eq!(names, vec!["agent-3", "agent-5"]);
    assert_eq!(fleet.capacity_used(), 1);

    let adopted = fleet.instance("agent-3").unwrap();
    assert_eq!(fleet.observed_state(&adopted), Some(ProviderState::Running));

    // agent-5 is stopped but outdated, so a fresh slot is created past it.
    let next = fleet.start_new_instance(UserData::new()).await.unwrap();
    assert_eq!(next.name(), "agent-6");
    assert!(connector.calls_of(MockOp::Start).is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconcile_racing_a_terminate_does_not_revive_the_slot() {
    let connector = Arc::new(
        MockConnector::new().with_latency_for("linux-agents", Duration::from_millis(50)),
    );
    let fleet = fleet(image(1, false), &connector);

    let inst = fleet.start_new_instance(UserData::new()).await.unwrap();

    // The listing is taken before the delete and delivered after it.
    let reconcile = tokio::spawn({
        let fleet = fleet.clone();
        async move { fleet.reconcile().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    fleet.terminate_instance(&inst).await.unwrap();

    assert_eq!(reconcile.await.unwrap().unwrap(), 0);
    assert!(fleet.instances().is_empty());
    assert_eq!(fleet.capacity_used(), 0);
    assert_eq!(connector.provider_state("agent-1"), None);

    let next = fleet.start_new_instance(UserData::new()).await.unwrap();
    assert_eq!(next.name(), "agent-2");
}

#[tokio::test]
async fn observed_state_never_fetches() {
    let connector = Arc::new(MockConnector::new());
    let fleet = fleet(image(1, false), &connector);

    let inst = fleet.start_new_instance(UserData::new()).await.unwrap();

    assert_eq!(fleet.observed_state(&inst), None);
    assert_eq!(connector.fetch_count(), 0);
}

#[tokio::test]
async fn instances_of_other_fleets_are_rejected() {
    let connector = Arc::new(MockConnector::new());
    let a = fleet(image(1, false), &connector);
    let b = fleet(image(1, false), &connector);

    let inst = a.start_new_instance(UserData::new()).await.unwrap();
    let err = b.terminate_instance(&inst).await.unwrap_err();

    assert!(matches!(err, FleetError::UnknownInstance(ref name) if name == "agent-1"));
    assert_eq!(inst.status(), InstanceStatus::Running);
}

#[test]
fn invalid_descriptor_reports_every_problem() {
    let bad = ImageDescriptor {
        max_instances: 0,
        region: "".into(),
        name_prefix: "".into(),
        ..image(1, false)
    };

    let err = FleetController::new(bad, Arc::new(MockConnector::new()))
        .err()
        .unwrap();
    match err {
        FleetError::Validation(errs) => assert_eq!(errs.len(), 3, "{errs}"),
        other => panic!("unexpected error: {other}"),
    }
}
