//! The authentication handshake, driver side.
//!
//! Authentication is a sequence of `authenticate` calls on (service 0,
//! object 0) carrying a capability map. The server answers with a map
//! whose `__qi_auth_state` is `Done` (proceed), `Continue` (it issued a
//! replacement token; authenticate once more with it) or `Error`.
//!
//! Peers predating service 0 get the legacy fallback: the proposed map is
//! sent in a raw `Capability` frame, and a capability frame back within
//! the configured window counts as success.

use qibus_proto::capability::{KEY_NEW_TOKEN, KEY_TOKEN};
use qibus_proto::meta::action;
use qibus_proto::{AuthState, CapabilityMap, Header, Kind, Message, Value};
use qibus_net::consumer;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

use crate::client::Client;
use crate::errors::ClientError;

/// Authenticate with explicit credentials; empty strings are omitted from
/// the proposed map. Returns the negotiated capability map.
pub async fn authenticate(
    client: &Client,
    user: &str,
    token: &str,
) -> Result<CapabilityMap, ClientError> {
    let mut preferred = CapabilityMap::preferred(user, token);
    authenticate_map(client, &mut preferred).await?;
    Ok(preferred)
}

/// Run the handshake with a caller-built capability map.
///
/// On success `preferred` holds the negotiated capabilities; if the server
/// rotated the token, the new token is exposed under `auth_newToken` while
/// `auth_token` keeps its original value for the caller to persist.
pub async fn authenticate_map(
    client: &Client,
    preferred: &mut CapabilityMap,
) -> Result<(), ClientError> {
    let response = authenticate_call(client, preferred).await?;
    match state_of(&response)? {
        AuthState::Done => {
            preferred.set_authenticated();
            Ok(())
        },
        AuthState::Continue => renew_token(client, preferred, &response).await,
        AuthState::Error => Err(ClientError::AuthFailed("authentication refused".to_string())),
    }
}

/// One authenticate exchange, with the legacy capability-frame fallback.
async fn authenticate_call(
    client: &Client,
    preferred: &CapabilityMap,
) -> Result<CapabilityMap, ClientError> {
    // Arm the capability-frame handler before calling, so a legacy peer's
    // frame cannot race past us.
    let endpoint = client.endpoint().clone();
    let (tx, rx) = oneshot::channel();
    let slot = Arc::new(Mutex::new(Some(tx)));
    let consumer_slot = slot.clone();
    let handler = endpoint.add_handler(
        Box::new(|hdr: &Header| {
            if hdr.kind() == Some(Kind::Capability) {
                (true, false)
            } else {
                (false, true)
            }
        }),
        consumer(move |msg| {
            let slot = consumer_slot.clone();
            async move {
                let map = CapabilityMap::from_payload(&msg.payload);
                if let Some(tx) = take(&slot) {
                    let _ = tx.send(map);
                }
                Ok(())
            }
        }),
        Box::new(|_| {}),
    );

    match client.call(0, 0, action::AUTHENTICATE, preferred.to_payload()).await {
        Ok(payload) => {
            let _ = endpoint.remove_handler(handler);
            CapabilityMap::from_payload(&payload).map_err(Into::into)
        },
        Err(call_err) => {
            tracing::debug!("authenticate call failed ({call_err}), trying capability exchange");
            let msg =
                Message::new(Kind::Capability, 2, 0, 0, 0, preferred.to_payload());
            endpoint.send(msg).await?;

            match tokio::time::timeout(client.config().legacy_capability_timeout, rx).await {
                Ok(Ok(map)) => {
                    // A capability frame back means the peer accepted us.
                    let mut map = map?;
                    map.set_authenticated();
                    Ok(map)
                },
                Ok(Err(_)) => Err(ClientError::Disconnected),
                Err(_) => {
                    let _ = endpoint.remove_handler(handler);
                    Err(ClientError::AuthTimeout)
                },
            }
        },
    }
}

/// `Continue` handling: re-authenticate with the issued token, then expose
/// it as `auth_newToken` and restore the original `auth_token`.
async fn renew_token(
    client: &Client,
    preferred: &mut CapabilityMap,
    response: &CapabilityMap,
) -> Result<(), ClientError> {
    let new_token = response
        .get_str(KEY_NEW_TOKEN)
        .ok_or_else(|| ClientError::AuthFailed("missing renewal token".to_string()))?;

    let old_token = preferred.get(KEY_TOKEN).cloned();
    preferred.insert(KEY_TOKEN, Value::from_string(&new_token));

    let second = authenticate_call(client, preferred).await.map_err(|e| {
        ClientError::AuthFailed(format!("renewed token rejected: {e}"))
    })?;
    match state_of(&second)? {
        AuthState::Done => {
            preferred.insert(KEY_NEW_TOKEN, Value::from_string(&new_token));
            match old_token {
                Some(token) => preferred.insert(KEY_TOKEN, token),
                None => {
                    preferred.remove(KEY_TOKEN);
                },
            }
            preferred.set_authenticated();
            Ok(())
        },
        AuthState::Continue => {
            Err(ClientError::AuthFailed("token renewal requested again".to_string()))
        },
        AuthState::Error => {
            Err(ClientError::AuthFailed("renewed token refused".to_string()))
        },
    }
}

fn state_of(map: &CapabilityMap) -> Result<AuthState, ClientError> {
    let raw = map
        .state_raw()
        .ok_or_else(|| ClientError::AuthFailed("missing authentication state".to_string()))?;
    AuthState::from_u32(raw).ok_or(ClientError::AuthBadState(raw))
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}
