//! Authorize handler

use rust_ocpp::v1_6::messages::authorize::{AuthorizeRequest, AuthorizeResponse};
use rust_ocpp::v1_6::types::{AuthorizationStatus, IdTagInfo};
use serde_json::Value;
use tracing::info;

use super::{parse_payload, to_payload, HandlerResult};
use crate::application::OcppHandler;
use crate::domain::AuthorizationDecision;

pub async fn handle_authorize(handler: &OcppHandler, payload: Value) -> HandlerResult {
    let req: AuthorizeRequest = parse_payload(handler, "Authorize", payload)?;

    let decision = handler.transactions.authorize(&req.id_tag).await;

    info!(
        charge_point_id = handler.charge_point_id.as_str(),
        id_tag = req.id_tag.as_str(),
        ?decision,
        "Authorize"
    );

    to_payload(&AuthorizeResponse {
        id_tag_info: id_tag_info(decision),
    })
}

pub(crate) fn id_tag_info(decision: AuthorizationDecision) -> IdTagInfo {
    IdTagInfo {
        status: authorization_status(decision),
        expiry_date: None,
        parent_id_tag: None,
    }
}

pub(crate) fn authorization_status(decision: AuthorizationDecision) -> AuthorizationStatus {
    match decision {
        AuthorizationDecision::Accepted => AuthorizationStatus::Accepted,
        AuthorizationDecision::Blocked => AuthorizationStatus::Blocked,
        AuthorizationDecision::Expired => AuthorizationStatus::Expired,
        AuthorizationDecision::Invalid => AuthorizationStatus::Invalid,
        AuthorizationDecision::ConcurrentTx => AuthorizationStatus::ConcurrentTx,
    }
}
