//! End-to-end scenarios driven through the public [`Dispatcher`] API
//! against the deterministic [`FakeBus`], one per walkthrough in
//! spec.md §8.

use std::collections::BTreeMap;
use std::sync::Arc;

use channel_dispatcher::bus::fake::{Call, FakeBus};
use channel_dispatcher::bus::{ApproverDecision, BusConnection, RawClientProperties, RawFilter};
use channel_dispatcher::channel::{Channel, ChannelPath, ChannelStatus};
use channel_dispatcher::dispatcher::Dispatcher;
use channel_dispatcher::registry::ClientRegistry;
use channel_dispatcher::value::{PropertyMap, Value};

fn text_filter() -> RawFilter {
    let mut f: RawFilter = BTreeMap::new();
    f.insert("type".to_string(), ('s', "text".to_string()));
    f
}

fn text_channel(path: &str) -> Channel {
    let mut props = PropertyMap::new();
    props.insert("type".to_string(), Value::Str("text".into()));
    Channel::new(ChannelPath(path.to_string()), props)
}

async fn dispatcher_with(bus: Arc<FakeBus>) -> Dispatcher {
    let registry = ClientRegistry::new(Arc::clone(&bus) as Arc<dyn BusConnection>, "org.example.", Vec::new());
    registry.bootstrap().await.unwrap();
    Dispatcher::new(registry, bus, Vec::new())
}

#[tokio::test]
async fn single_matching_handler_dispatches_directly() {
    let bus = FakeBus::new();
    bus.register_owned(
        "org.example.H1",
        RawClientProperties {
            interfaces: vec!["Observer".to_string(), "Handler".to_string()],
            observer_filters: vec![text_filter()],
            handler_filters: vec![text_filter()],
            ..Default::default()
        },
    );
    let dispatcher = dispatcher_with(bus.clone()).await;

    dispatcher.take_channels("acct0", vec![text_channel("/c1")]).await;

    let dispatched = dispatcher.dispatched_channel(&ChannelPath("/c1".into())).unwrap();
    assert_eq!(dispatched.status, ChannelStatus::Dispatched);
    assert!(bus.calls().iter().any(|c| matches!(c, Call::Observe { client, .. } if client == "org.example.H1")));
    assert!(bus.calls().iter().any(|c| matches!(c, Call::Handle { client, .. } if client == "org.example.H1")));
}

#[tokio::test]
async fn two_approvers_one_declines_the_other_redirects() {
    let bus = FakeBus::new();
    bus.register_owned(
        "org.example.H1",
        RawClientProperties {
            interfaces: vec!["Handler".to_string()],
            handler_filters: vec![text_filter()],
            ..Default::default()
        },
    );
    bus.register_owned(
        "org.example.H2",
        RawClientProperties {
            interfaces: vec!["Handler".to_string()],
            handler_filters: vec![text_filter()],
            ..Default::default()
        },
    );
    bus.register_owned(
        "org.example.P1",
        RawClientProperties {
            interfaces: vec!["Approver".to_string()],
            approver_filters: vec![text_filter()],
            ..Default::default()
        },
    );
    bus.register_owned(
        "org.example.P2",
        RawClientProperties {
            interfaces: vec!["Approver".to_string()],
            approver_filters: vec![text_filter()],
            ..Default::default()
        },
    );
    bus.script_add_dispatch_operation_failure("org.example.P1");
    bus.script_approver_decision("org.example.P2", ApproverDecision::HandleWith(Some("org.example.H2".to_string())));

    let dispatcher = dispatcher_with(bus.clone()).await;
    dispatcher.take_channels("acct0", vec![text_channel("/c1")]).await;

    let dispatched = dispatcher.dispatched_channel(&ChannelPath("/c1".into())).unwrap();
    assert_eq!(dispatched.status, ChannelStatus::Dispatched);
    assert!(bus.calls().iter().any(|c| matches!(c, Call::Handle { client, .. } if client == "org.example.H2")));
    assert!(!bus.calls().iter().any(|c| matches!(c, Call::Handle { client, .. } if client == "org.example.H1")));
}

#[tokio::test]
async fn bypass_approval_handler_skips_the_operation() {
    let bus = FakeBus::new();
    bus.register_owned(
        "org.example.H1",
        RawClientProperties {
            interfaces: vec!["Handler".to_string()],
            handler_filters: vec![text_filter()],
            bypass_approval: true,
            ..Default::default()
        },
    );
    bus.register_owned(
        "org.example.P1",
        RawClientProperties {
            interfaces: vec!["Approver".to_string()],
            approver_filters: vec![text_filter()],
            ..Default::default()
        },
    );

    let dispatcher = dispatcher_with(bus.clone()).await;
    dispatcher.take_channels("acct0", vec![text_channel("/c1")]).await;

    let dispatched = dispatcher.dispatched_channel(&ChannelPath("/c1".into())).unwrap();
    assert_eq!(dispatched.status, ChannelStatus::Dispatched);
    assert!(bus.calls().iter().all(|c| !matches!(c, Call::AddDispatchOperation { .. })));
}

#[tokio::test]
async fn no_matching_handler_is_refused_without_contacting_any_client() {
    let bus = FakeBus::new();
    bus.register_owned(
        "org.example.H1",
        RawClientProperties {
            interfaces: vec!["Handler".to_string()],
            handler_filters: vec![{
                let mut f: RawFilter = BTreeMap::new();
                f.insert("type".to_string(), ('s', "voice".to_string()));
                f
            }],
            ..Default::default()
        },
    );

    let dispatcher = dispatcher_with(bus.clone()).await;
    dispatcher.take_channels("acct0", vec![text_channel("/c1")]).await;

    assert!(dispatcher.dispatched_channel(&ChannelPath("/c1".into())).is_none());
    assert!(bus.calls().is_empty());
}

#[tokio::test]
async fn cancellation_before_the_handler_phase_prevents_invocation() {
    let bus = FakeBus::new();
    bus.register_owned(
        "org.example.H1",
        RawClientProperties {
            interfaces: vec!["Handler".to_string()],
            handler_filters: vec![text_filter()],
            ..Default::default()
        },
    );
    bus.register_owned(
        "org.example.P1",
        RawClientProperties {
            interfaces: vec!["Approver".to_string()],
            approver_filters: vec![text_filter()],
            ..Default::default()
        },
    );

    let dispatcher = Arc::new(dispatcher_with(bus.clone()).await);
    let path = ChannelPath("/c1".into());

    // Cancellation races the pipeline: register the flag's entry is
    // synchronous at the top of `take_channels`, so yielding once after
    // spawning it lands the cancel before the handler phase gates on it.
    let runner = Arc::clone(&dispatcher);
    let handle = tokio::spawn(async move { runner.take_channels("acct0", vec![text_channel("/c1")]).await });
    tokio::task::yield_now().await;
    dispatcher.cancel(&path);
    handle.await.unwrap();

    assert!(dispatcher.dispatched_channel(&path).is_none());
    assert!(!bus.calls().iter().any(|c| matches!(c, Call::Handle { .. })));
}

#[tokio::test]
async fn startup_recovery_reconciles_already_owned_channels() {
    let bus = FakeBus::new();
    bus.register_owned(
        "org.example.H1",
        RawClientProperties {
            interfaces: vec!["Handler".to_string()],
            handler_filters: vec![text_filter()],
            ..Default::default()
        },
    );
    bus.set_handled_channels("org.example.H1", vec![ChannelPath("/c1".into())]);

    let registry = ClientRegistry::new(Arc::clone(&bus) as Arc<dyn BusConnection>, "org.example.", Vec::new());
    let dispatcher = Dispatcher::new(registry, bus.clone(), Vec::new());

    dispatcher
        .bootstrap(vec![text_channel("/c1"), text_channel("/c2")])
        .await
        .unwrap();

    let recovered = dispatcher.dispatched_channel(&ChannelPath("/c1".into())).unwrap();
    assert_eq!(recovered.status, ChannelStatus::Dispatched);

    // /c2 was unowned, so bootstrap re-submits it through take_channels,
    // landing on the only handler.
    let resubmitted = dispatcher.dispatched_channel(&ChannelPath("/c2".into())).unwrap();
    assert_eq!(resubmitted.status, ChannelStatus::Dispatched);
}
