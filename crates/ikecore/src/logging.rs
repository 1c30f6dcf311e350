//! Structured logging for IKE and policy operations
//!
//! Provides structured, contextual logging using the `tracing` framework.
//! All log messages include relevant context fields for debugging.
//!
//! # Log Levels
//!
//! - **TRACE**: Message send/receive, timer firing
//! - **DEBUG**: Proposal selection, duplicate requests, SADB lookups
//! - **INFO**: IKE state transitions, handshake events, SA install/delete
//! - **WARN**: Dropped messages, lock timeouts, non-fatal cleanup failures
//! - **ERROR**: Failed negotiations, authentication failures
//!
//! # Example
//!
//! ```no_run
//! use ikecore::logging;
//!
//! // Initialize tracing subscriber (in tests or applications)
//! tracing_subscriber::fmt()
//!     .with_env_filter("ikecore=debug")
//!     .init();
//!
//! logging::log_ike_state_transition(
//!     &[0x01, 0x02, 0x03, 0x04],
//!     &[0x05, 0x06, 0x07, 0x08],
//!     "SA_INIT_SENT",
//!     "COMPLETE",
//! );
//! ```

use tracing::{debug, error, info, trace, warn};

use crate::error::Error;

/// Log IKE SA state transition
///
/// # Arguments
///
/// * `spi_i` - Initiator SPI (or cookie for IKEv1)
/// * `spi_r` - Responder SPI (or cookie for IKEv1)
/// * `old_state` - Previous state
/// * `new_state` - New state
pub fn log_ike_state_transition(spi_i: &[u8], spi_r: &[u8], old_state: &str, new_state: &str) {
    info!(
        ike_spi_i = %hex::encode(spi_i),
        ike_spi_r = %hex::encode(spi_r),
        state_from = old_state,
        state_to = new_state,
        "IKE SA state transition"
    );
}

/// Log IKE handshake start
///
/// # Arguments
///
/// * `peer_addr` - Peer IP address and port
/// * `role` - "initiator" or "responder"
/// * `exchange` - Exchange style (e.g. "IKEv2", "Main Mode")
pub fn log_handshake_start(peer_addr: &str, role: &str, exchange: &str) {
    info!(
        peer = peer_addr,
        role = role,
        exchange = exchange,
        "IKE handshake started"
    );
}

/// Log IKE handshake completion
pub fn log_handshake_complete(peer_addr: &str, spi_i: &[u8], spi_r: &[u8]) {
    info!(
        peer = peer_addr,
        ike_spi_i = %hex::encode(spi_i),
        ike_spi_r = %hex::encode(spi_r),
        "IKE handshake completed successfully"
    );
}

/// Log IKE handshake failure
///
/// # Arguments
///
/// * `peer_addr` - Peer IP address and port
/// * `error` - Error that ended the negotiation
pub fn log_handshake_failed(peer_addr: &str, error: &Error) {
    error!(
        peer = peer_addr,
        error = %error,
        "IKE handshake failed"
    );
}

/// Log IKE SA rekey start
pub fn log_ike_rekey_start(old_spi_i: &[u8], old_spi_r: &[u8]) {
    info!(
        old_spi_i = %hex::encode(old_spi_i),
        old_spi_r = %hex::encode(old_spi_r),
        "IKE SA rekey started"
    );
}

/// Log IKE SA rekey completion
pub fn log_ike_rekey_complete(old_spi_i: &[u8], new_spi_i: &[u8], new_spi_r: &[u8]) {
    info!(
        old_spi_i = %hex::encode(old_spi_i),
        new_spi_i = %hex::encode(new_spi_i),
        new_spi_r = %hex::encode(new_spi_r),
        "IKE SA rekey completed successfully"
    );
}

/// Log proposal negotiation
///
/// # Arguments
///
/// * `offered` - Number of proposals offered
/// * `chosen` - Number of chosen proposal, or None if no match
pub fn log_proposal_negotiation(offered: usize, chosen: Option<u8>) {
    match chosen {
        Some(num) => {
            debug!(
                proposals_offered = offered,
                chosen = num,
                "Proposal negotiation successful"
            );
        }
        None => {
            warn!(
                proposals_offered = offered,
                "Proposal negotiation failed - no acceptable proposal"
            );
        }
    }
}

/// Log installation of an inbound/outbound child SA pair
///
/// # Arguments
///
/// * `inbound_spi` - SPI of the inbound SA
/// * `outbound_spi` - SPI of the outbound SA
/// * `protocol` - IPsec protocol (50 for ESP, 51 for AH)
pub fn log_child_sa_installed(inbound_spi: u32, outbound_spi: u32, protocol: u8) {
    info!(
        inbound_spi = format_args!("0x{:08x}", inbound_spi),
        outbound_spi = format_args!("0x{:08x}", outbound_spi),
        protocol = protocol,
        "Child SA pair installed"
    );
}

/// Log Child SA deletion
///
/// # Arguments
///
/// * `child_spi` - Child SA SPI
/// * `reason` - Deletion reason (e.g. "peer delete", "rekey", "lifetime")
pub fn log_child_sa_deleted(child_spi: u32, reason: &str) {
    info!(
        child_spi = format_args!("0x{:08x}", child_spi),
        reason = reason,
        "Child SA deleted"
    );
}

/// Log a delete request that matched nothing locally
pub fn log_child_sa_delete_miss(child_spi: u32, protocol: u8) {
    debug!(
        child_spi = format_args!("0x{:08x}", child_spi),
        protocol = protocol,
        "Delete request matched no local SA"
    );
}

/// Log received notification
pub fn log_notify_received(notify_type: u16, is_error: bool) {
    if is_error {
        warn!(notify_type = notify_type, "Error notification received");
    } else {
        debug!(notify_type = notify_type, "Status notification received");
    }
}

/// Log liveness probe answered
pub fn log_liveness_probe(peer_addr: &str) {
    debug!(peer = peer_addr, "Liveness check answered");
}

/// Log retransmitted response for a duplicate request
pub fn log_duplicate_request(peer_addr: &str, message_id: u32) {
    debug!(
        peer = peer_addr,
        message_id = message_id,
        "Duplicate request - resending saved response"
    );
}

/// Log message dropped before processing
pub fn log_message_dropped(peer_addr: &str, error: &Error) {
    warn!(peer = peer_addr, error = %error, "IKE message dropped");
}

/// Log SA request raised by the policy engine
pub fn log_sa_request(policy_index: u32, protocol: u8) {
    info!(
        policy_index = policy_index,
        protocol = protocol,
        "Requesting IKE negotiation for missing SA"
    );
}

/// Log removal of a security policy
pub fn log_policy_removed(policy_index: u32, bundles: usize) {
    info!(
        policy_index = policy_index,
        bundles_removed = bundles,
        "Security policy removed"
    );
}

/// Log a lock acquisition timeout
pub fn log_lock_timeout(resource: &str, wait_ms: u64) {
    warn!(
        resource = resource,
        wait_ms = wait_ms,
        "Timed out acquiring resource lock"
    );
}

/// Log a failure on a secondary cleanup path
pub fn log_cleanup_failure(context: &str, error: &Error) {
    warn!(context = context, error = %error, "Non-fatal cleanup failure");
}

/// Log timer event firing
pub fn log_timer_event(event: &str, subject: u64) {
    trace!(event = event, subject = subject, "Timer event fired");
}

/// Log protocol message send
///
/// # Arguments
///
/// * `msg_type` - Message type (e.g., "IKE_SA_INIT", "QUICK")
/// * `peer_addr` - Peer address
/// * `size_bytes` - Message size in bytes
pub fn log_message_send(msg_type: &str, peer_addr: &str, size_bytes: usize) {
    trace!(
        msg_type = msg_type,
        peer = peer_addr,
        size_bytes = size_bytes,
        "Sending IKE message"
    );
}

/// Log protocol message receive
pub fn log_message_recv(msg_type: &str, peer_addr: &str, size_bytes: usize) {
    trace!(
        msg_type = msg_type,
        peer = peer_addr,
        size_bytes = size_bytes,
        "Received IKE message"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_functions() {
        // These only verify the helpers execute without a subscriber

        log_ike_state_transition(&[0x01, 0x02], &[0x03, 0x04], "START", "COMPLETE");
        log_handshake_start("10.0.0.1:500", "initiator", "IKEv2");
        log_handshake_complete("10.0.0.1:500", &[1; 8], &[2; 8]);
        log_handshake_failed("10.0.0.1:500", &Error::NoProposalChosen);
        log_ike_rekey_start(&[0x01], &[0x02]);
        log_ike_rekey_complete(&[0x01], &[0x03], &[0x04]);
        log_proposal_negotiation(3, Some(1));
        log_proposal_negotiation(3, None);
        log_child_sa_installed(0x1000, 0x2000, 50);
        log_child_sa_deleted(0x1000, "peer delete");
        log_child_sa_delete_miss(0x3000, 50);
        log_notify_received(14, true);
        log_notify_received(16393, false);
        log_liveness_probe("10.0.0.1:500");
        log_duplicate_request("10.0.0.1:500", 4);
        log_message_dropped("10.0.0.1:500", &Error::PacketDiscard);
        log_sa_request(7, 50);
        log_policy_removed(7, 2);
        log_lock_timeout("spd", 500);
        log_cleanup_failure("bundle timer", &Error::NotFound("event".into()));
        log_timer_event("bundle_lifetime", 9);
        log_message_send("IKE_SA_INIT", "10.0.0.1:500", 256);
        log_message_recv("IKE_SA_INIT", "10.0.0.1:500", 256);
    }
}
