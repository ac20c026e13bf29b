//! Request Entry Point: §4.6.
//!
//! `create_channel`/`ensure_channel` are the dispatcher's only
//! synchronous-looking bus methods: validate, ask the account layer to
//! construct the channel, return its path, and arrange for
//! `add_request`/`remove_request` delivery to the preferred handler.
//! The account layer itself is a collaborator out of scope for this
//! crate (§1); [`AccountDirectory`] is the interface this crate
//! consumes from it.
//!
//! `ensure_channel`'s `reuse_existing` path can land on a channel
//! already `Dispatched` from a prior batch (§4.3 "Re-invocation"): a
//! second request for the same logical channel while it is still live.
//! That case bypasses filters, observers and approvers entirely and
//! redelivers straight to the handler already holding it, via
//! [`crate::dispatcher::Dispatcher::redeliver`].

use async_trait::async_trait;
use tracing::warn;

use crate::channel::{Channel, ChannelPath};
use crate::dispatcher::Dispatcher;
use crate::error::RequestError;
use crate::registry::ClientRegistry;
use crate::value::PropertyMap;

/// The account layer's channel-construction surface, as consumed by
/// the request entry point. A real implementation would be backed by
/// the account-manager facade named in §1 as out of scope.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn exists(&self, account: &str) -> bool;

    /// Construct (or, when `reuse_existing` is set, find-or-construct)
    /// a channel in state `Request` for `account`.
    async fn construct_channel(
        &self,
        account: &str,
        properties: PropertyMap,
        preferred_handler: Option<String>,
        reuse_existing: bool,
    ) -> Result<Channel, RequestError>;
}

fn validate_preferred_handler(registry: &ClientRegistry, name: &str) -> Result<(), RequestError> {
    let well_formed = name.starts_with(registry.prefix())
        && name.len() > registry.prefix().len()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if well_formed {
        Ok(())
    } else {
        Err(RequestError::InvalidHandlerName(name.to_string()))
    }
}

async fn request_channel(
    dispatcher: &Dispatcher,
    accounts: &dyn AccountDirectory,
    account: &str,
    properties: PropertyMap,
    user_action_time: i64,
    preferred_handler: Option<String>,
    reuse_existing: bool,
) -> Result<ChannelPath, RequestError> {
    if !accounts.exists(account).await {
        return Err(RequestError::UnknownAccount(account.to_string()));
    }
    if let Some(name) = &preferred_handler {
        validate_preferred_handler(&dispatcher.registry, name)?;
    }

    let mut channel = accounts
        .construct_channel(account, properties, preferred_handler.clone(), reuse_existing)
        .await?;
    let path = channel.path.clone();

    if reuse_existing {
        if let Some(handler) = dispatcher
            .dispatched_channel(&path)
            .and_then(|existing| existing.handled_by)
        {
            dispatcher.redeliver(&path, &handler).await.map_err(|e| {
                warn!(channel = %path, handler = %handler, error = %e, "redelivery to existing handler failed");
                RequestError::ChannelConstruction(e.to_string())
            })?;
            return Ok(path);
        }
    }

    channel.merge_request(user_action_time);

    if let Some(name) = &preferred_handler {
        if dispatcher.registry.get(name).is_some_and(|c| c.capabilities.requests) {
            if let Err(e) = dispatcher.bus().add_request(name, &path.0).await {
                warn!(handler = %name, error = %e, "failed to deliver add_request to preferred handler");
            }
        }
    }

    Ok(path)
}

/// Always constructs a new channel.
pub async fn create_channel(
    dispatcher: &Dispatcher,
    accounts: &dyn AccountDirectory,
    account: &str,
    properties: PropertyMap,
    user_action_time: i64,
    preferred_handler: Option<String>,
) -> Result<ChannelPath, RequestError> {
    request_channel(dispatcher, accounts, account, properties, user_action_time, preferred_handler, false).await
}

/// Reuses an existing matching channel if the account layer finds one.
/// When that channel is already `Dispatched`, this is a re-invocation:
/// see the module doc comment.
pub async fn ensure_channel(
    dispatcher: &Dispatcher,
    accounts: &dyn AccountDirectory,
    account: &str,
    properties: PropertyMap,
    user_action_time: i64,
    preferred_handler: Option<String>,
) -> Result<ChannelPath, RequestError> {
    request_channel(dispatcher, accounts, account, properties, user_action_time, preferred_handler, true).await
}

/// Step 5 of §4.6: on failure of the underlying channel, `remove_request`
/// is delivered to the same preferred handler that got `add_request`.
pub async fn notify_request_failed(dispatcher: &Dispatcher, preferred_handler: &str, path: &ChannelPath) {
    if let Err(e) = dispatcher.bus().remove_request(preferred_handler, &path.0).await {
        warn!(handler = %preferred_handler, error = %e, "failed to deliver remove_request");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bus::fake::{Call, FakeBus};
    use crate::bus::{BusConnection, RawClientProperties};
    use crate::value::Value;
    use dashmap::DashMap;

    fn dispatcher(bus: Arc<FakeBus>) -> Dispatcher {
        let registry = ClientRegistry::new(Arc::clone(&bus) as Arc<dyn BusConnection>, "org.example.", Vec::new());
        Dispatcher::new(registry, bus as Arc<dyn BusConnection>, Vec::new())
    }

    struct FakeAccounts {
        known: DashMap<String, ()>,
        fail: bool,
    }

    impl FakeAccounts {
        fn new(accounts: &[&str]) -> Self {
            let known = DashMap::new();
            for a in accounts {
                known.insert(a.to_string(), ());
            }
            Self { known, fail: false }
        }
    }

    #[async_trait]
    impl AccountDirectory for FakeAccounts {
        async fn exists(&self, account: &str) -> bool {
            self.known.contains_key(account)
        }

        async fn construct_channel(
            &self,
            _account: &str,
            properties: PropertyMap,
            preferred_handler: Option<String>,
            _reuse_existing: bool,
        ) -> Result<Channel, RequestError> {
            if self.fail {
                return Err(RequestError::ChannelConstruction("refused".to_string()));
            }
            Ok(Channel::requested(ChannelPath("/c1".into()), properties, preferred_handler))
        }
    }

    #[tokio::test]
    async fn unknown_account_is_rejected() {
        let bus = FakeBus::new();
        let dispatcher = dispatcher(bus);
        let accounts = FakeAccounts::new(&[]);

        let result = create_channel(&dispatcher, &accounts, "acct0", PropertyMap::new(), 0, None).await;
        assert_eq!(result, Err(RequestError::UnknownAccount("acct0".to_string())));
    }

    #[tokio::test]
    async fn malformed_preferred_handler_is_rejected() {
        let bus = FakeBus::new();
        let dispatcher = dispatcher(bus);
        let accounts = FakeAccounts::new(&["acct0"]);

        let result = create_channel(
            &dispatcher,
            &accounts,
            "acct0",
            PropertyMap::new(),
            0,
            Some("not a bus name!".to_string()),
        )
        .await;
        assert!(matches!(result, Err(RequestError::InvalidHandlerName(_))));
    }

    #[tokio::test]
    async fn add_request_is_delivered_to_preferred_handler() {
        let bus = FakeBus::new();
        bus.register_owned(
            "org.example.H1",
            RawClientProperties {
                interfaces: vec!["Requests".to_string()],
                ..Default::default()
            },
        );
        let dispatcher = dispatcher(bus.clone());
        dispatcher.registry.bootstrap().await.unwrap();
        let accounts = FakeAccounts::new(&["acct0"]);

        let mut props = PropertyMap::new();
        props.insert("type".to_string(), Value::Str("text".into()));

        let path = create_channel(
            &dispatcher,
            &accounts,
            "acct0",
            props,
            42,
            Some("org.example.H1".to_string()),
        )
        .await
        .unwrap();

        assert_eq!(path, ChannelPath("/c1".into()));
        assert!(bus
            .calls()
            .iter()
            .any(|c| matches!(c, Call::AddRequest { client, .. } if client == "org.example.H1")));
    }

    #[tokio::test]
    async fn ensure_channel_redelivers_to_the_existing_handler_when_already_dispatched() {
        let bus = FakeBus::new();
        bus.register_owned(
            "org.example.H1",
            RawClientProperties {
                interfaces: vec!["Handler".to_string()],
                ..Default::default()
            },
        );
        bus.set_handled_channels("org.example.H1", vec![ChannelPath("/c1".into())]);

        let dispatcher = dispatcher(bus.clone());
        dispatcher
            .bootstrap(vec![Channel::new(ChannelPath("/c1".into()), PropertyMap::new())])
            .await
            .unwrap();

        let accounts = FakeAccounts::new(&["acct0"]);
        let path = ensure_channel(&dispatcher, &accounts, "acct0", PropertyMap::new(), 0, None)
            .await
            .unwrap();

        assert_eq!(path, ChannelPath("/c1".into()));
        let handle_calls = bus
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Handle { client, .. } if client == "org.example.H1"))
            .count();
        assert_eq!(handle_calls, 1, "redelivery must call the existing handler exactly once");
        assert!(
            !bus.calls().iter().any(|c| matches!(c, Call::AddRequest { .. })),
            "a re-invocation bypasses the normal request flow"
        );
    }
}
