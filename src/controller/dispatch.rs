use serde::Serialize;
use std::sync::Arc;

use super::protocol::{self as p, ControlMessage, ControlReply};
use super::Controller;
use crate::error::{ControlError, ControlResult};
use crate::proxy::ChannelFilter;
use crate::viewer::SessionViewer;

fn to_bytes<T: Serialize + ?Sized>(value: &T) -> ControlResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Run one verified command against the controller and build its reply.
/// Required fields are checked before anything is touched.
pub async fn handle_message(controller: &Controller, message: ControlMessage) -> ControlReply {
    let reply = ControlReply::to(&message.message_type);
    match run(controller, &message, reply.clone()).await {
        Ok(reply) => reply,
        Err(e) => reply.failed(&e),
    }
}

async fn run(controller: &Controller, m: &ControlMessage, mut reply: ControlReply) -> ControlResult<ControlReply> {
    let id = m.proxy_id;
    match m.message_type.as_str() {
        p::CREATE_PROXY => {
            let data = m
                .proxy_data
                .as_deref()
                .ok_or(ControlError::MissingField("No ProxyData provided"))?;
            reply.proxy_id = Some(controller.add_proxy_from_json(data)?);
        }
        p::START_PROXY => controller.start_proxy(id).await?,
        p::STOP_PROXY => controller.stop_proxy(id)?,
        p::DESTROY_PROXY => controller.destroy_proxy(id)?,
        p::ACTIVATE_PROXY => controller.activate_proxy(id)?,
        p::DEACTIVATE_PROXY => controller.deactivate_proxy(id)?,
        p::LIST_PROXIES => reply.proxies = Some(to_bytes(&controller.proxies())?),
        p::GET_PROXY_INFO => reply.proxy = Some(to_bytes(&*controller.get_proxy(id)?)?),
        p::GET_PROXY_VIEWER => {
            let viewer = if !m.viewer_secret.is_empty() {
                controller.get_proxy_viewer_by_secret(id, &m.viewer_secret)?
            } else if !m.session_key.is_empty() {
                controller.get_proxy_viewer_by_session_key(id, &m.session_key)?
            } else if !m.username.is_empty() {
                controller.get_proxy_viewer_by_username(id, &m.username)?
            } else {
                return Err(ControlError::MissingField(
                    "no viewer secret, session key, nor username provided",
                ));
            };
            reply.viewer = Some(to_bytes(&*viewer)?);
        }
        p::GET_PROXY_VIEWERS => {
            let viewers: Vec<Arc<SessionViewer>> = if !m.session_key.is_empty() {
                controller.get_proxy_viewers_by_session_key(id, &m.session_key)?
            } else if !m.username.is_empty() {
                controller.get_proxy_viewers_by_username(id, &m.username)?
            } else {
                controller.get_proxy_viewers(id)?
            };
            reply.viewers = Some(to_bytes(&viewers)?);
        }
        p::CREATE_SESSION_VIEWER | p::CREATE_USER_VIEWER | p::NEW_PROXY_VIEWER => {
            if m.username.is_empty() {
                return Err(ControlError::MissingField("No Username nor SessionKey provided"));
            }
            let viewer = if !m.session_key.is_empty() {
                controller.create_session_viewer(id, &m.username, &m.session_key)?
            } else {
                controller.create_user_viewer(id, &m.username)?
            };
            reply.viewer = Some(to_bytes(&*viewer)?);
        }
        p::ADD_PROXY_USER => {
            let user = m
                .proxy_user
                .as_ref()
                .ok_or(ControlError::MissingField("No proxyUser provided"))?;
            reply.user_key = Some(controller.add_user_to_proxy(id, user.clone_credentials())?);
        }
        p::REMOVE_PROXY_USER => {
            if m.username.is_empty() {
                return Err(ControlError::MissingField("Missing Username"));
            }
            controller.remove_user_from_proxy(id, &m.username, &m.password)?;
        }
        p::ADD_USER_FILTER | p::ADD_CHANNEL_FILTER => {
            let (Some(find), Some(replace), false) = (&m.find_string, &m.replace_string, m.username.is_empty()) else {
                return Err(ControlError::MissingField("Missing Username, FindString or ReplaceString"));
            };
            let filter = ChannelFilter::replace_all(find.clone(), replace.clone());
            reply.filter_key = Some(controller.add_user_filter(id, &m.username, &m.password, filter)?);
        }
        p::REMOVE_USER_FILTER | p::REMOVE_CHANNEL_FILTER => {
            if m.filter_key.is_empty() || m.username.is_empty() {
                return Err(ControlError::MissingField("Missing Username or FilterKey"));
            }
            controller.remove_user_filter(id, &m.username, &m.password, &m.filter_key)?;
        }
        p::ADD_USER_CALLBACK => {
            let (Some(find), false, false) = (&m.find_string, m.callback_url.is_empty(), m.username.is_empty()) else {
                return Err(ControlError::MissingField("Missing Username, FindString, or CallbackURL"));
            };
            let callback = controller
                .dispatcher()
                .substring_callback(m.callback_url.clone(), find.clone());
            reply.callback_key = Some(controller.add_user_callback(id, &m.username, &m.password, callback)?);
        }
        p::REMOVE_USER_CALLBACK => {
            if m.callback_key.is_empty() || m.username.is_empty() {
                return Err(ControlError::MissingField("Missing Username or CallbackKey"));
            }
            controller.remove_user_callback(id, &m.username, &m.password, &m.callback_key)?;
        }
        _ => return Err(ControlError::UnsupportedMessage),
    }
    Ok(reply)
}
