//! Notifications and INFORMATIONAL exchange helpers
//!
//! Status notifications steer the exchange that carries them; error
//! notifications abort it. Delete payloads remove child SA pairs and
//! are answered with the SPIs of the pairs removed on our side.

use super::constants::{NotifyType, ProtocolId};
use super::payload::{DeletePayload, NotifyPayload, Payload};
use super::sa::IkeSa;
use crate::error::{Error, Result};
use crate::install::InstalledChild;
use crate::logging;
use crate::spd::{IpsecProtocol, SecurityPolicyDb};

/// Status notifications found in a message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyFlags {
    /// USE_TRANSPORT_MODE
    pub transport_mode: bool,
    /// REKEY_SA with the SA it replaces
    pub rekey: Option<(ProtocolId, u32)>,
    /// COOKIE data
    pub cookie: Option<Vec<u8>>,
    /// INITIAL_CONTACT
    pub initial_contact: bool,
    /// First error notification
    pub error: Option<NotifyPayload>,
}

impl NotifyFlags {
    /// Error to raise for a response carrying an error notification
    pub fn response_error(&self) -> Result<()> {
        match &self.error {
            Some(n) => Err(Error::Notified(n.notify_type)),
            None => Ok(()),
        }
    }

    /// Error to raise for a request carrying an error notification
    ///
    /// Only types that abort the exchange stop a request; others are
    /// logged and ignored.
    pub fn request_error(&self) -> Result<()> {
        match &self.error {
            Some(n)
                if NotifyType::from_u16(n.notify_type).map_or(false, |t| t.aborts_exchange()) =>
            {
                Err(Error::Notified(n.notify_type))
            }
            _ => Ok(()),
        }
    }
}

/// Collect the notifications of a message
///
/// Unknown status types are ignored.
pub fn process_notifies(payloads: &[Payload]) -> NotifyFlags {
    let mut flags = NotifyFlags::default();
    for payload in payloads {
        let Payload::Notify(n) = payload else {
            continue;
        };
        let is_error = NotifyType::is_error_type(n.notify_type);
        logging::log_notify_received(n.notify_type, is_error);
        if is_error {
            if flags.error.is_none() {
                flags.error = Some(n.clone());
            }
            continue;
        }
        match NotifyType::from_u16(n.notify_type) {
            Some(NotifyType::UseTransportMode) => flags.transport_mode = true,
            Some(NotifyType::InitialContact) => flags.initial_contact = true,
            Some(NotifyType::Cookie) => flags.cookie = Some(n.data.clone()),
            Some(NotifyType::RekeySa) => {
                if let (Some(protocol), Ok(spi)) = (
                    ProtocolId::from_u8(n.protocol_id),
                    <[u8; 4]>::try_from(n.spi.as_slice()),
                ) {
                    flags.rekey = Some((protocol, u32::from_be_bytes(spi)));
                }
            }
            _ => {}
        }
    }
    flags
}

/// Status notifications echoed in the answer to a request
pub fn mirrored_notifies(flags: &NotifyFlags) -> Vec<Payload> {
    let mut out = Vec::new();
    if flags.transport_mode {
        out.push(Payload::Notify(NotifyPayload::new(
            NotifyType::UseTransportMode.to_u16(),
            Vec::new(),
        )));
    }
    out
}

/// Notification payload for an error
pub fn error_notify(notify_type: NotifyType, data: Vec<u8>) -> Payload {
    Payload::Notify(NotifyPayload::new(notify_type.to_u16(), data))
}

/// Delete payloads of a message
pub fn deletes(payloads: &[Payload]) -> impl Iterator<Item = &DeletePayload> {
    payloads.iter().filter_map(|p| match p {
        Payload::Delete(d) => Some(d),
        _ => None,
    })
}

fn ipsec_protocol(protocol: ProtocolId) -> Result<IpsecProtocol> {
    match protocol {
        ProtocolId::Ah => Ok(IpsecProtocol::Ah),
        ProtocolId::Esp => Ok(IpsecProtocol::Esp),
        ProtocolId::Ike => Err(Error::InvalidProtocol(protocol.to_u8())),
    }
}

/// Remove the child SA pairs named in a peer's Delete payload
///
/// The SPIs in the payload are the peer's inbound SPIs, i.e. our
/// outbound ones. Pairs not tracked by the IKE SA are looked up in the
/// policy group `fallback_group` by the peer's address.
///
/// # Returns
///
/// Delete payload listing our inbound SPIs of the removed pairs, or
/// `None` when nothing was removed.
pub fn remove_deleted_children(
    spd: &mut SecurityPolicyDb,
    sa: &mut IkeSa,
    fallback_group: &str,
    delete: &DeletePayload,
) -> Result<Option<DeletePayload>> {
    let protocol = ProtocolId::from_u8(delete.protocol_id)
        .ok_or(Error::InvalidProtocol(delete.protocol_id))?;
    let ipsec = ipsec_protocol(protocol)?;
    let mut ours = Vec::new();

    for spi in delete.child_spis()? {
        if let Some(b) = sa.bundle_by_outbound(spi, protocol) {
            let bundle = &mut sa.children[b];
            let Some(pos) = bundle
                .pairs
                .iter()
                .position(|p| p.outbound_spi == spi && p.protocol == ipsec)
            else {
                continue;
            };
            let pair: InstalledChild = bundle.pairs.remove(pos);
            if bundle.pairs.is_empty() {
                sa.children.remove(b);
            }
            match spd.remove_sa_pair(&pair.group, spi, ipsec, pair.destination) {
                Ok(_) | Err(Error::SaNotFound(_)) => {
                    logging::log_child_sa_deleted(pair.inbound_spi, "peer_delete");
                    ours.push(pair.inbound_spi);
                }
                Err(e) => spd.errors().record("child SA delete", e),
            }
            continue;
        }

        match spd.remove_sa_pair(fallback_group, spi, ipsec, sa.peer) {
            Ok(removed) => {
                let inbound = removed.inbound_spi.unwrap_or(spi);
                logging::log_child_sa_deleted(inbound, "peer_delete");
                ours.push(inbound);
            }
            Err(_) => logging::log_child_sa_delete_miss(spi, protocol.to_u8()),
        }
    }

    if ours.is_empty() {
        Ok(None)
    } else {
        Ok(Some(DeletePayload::child(protocol, &ours)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_notifies() {
        let payloads = vec![
            Payload::Notify(NotifyPayload::new(NotifyType::InitialContact.to_u16(), Vec::new())),
            Payload::Notify(NotifyPayload::for_child(
                NotifyType::RekeySa.to_u16(),
                ProtocolId::Esp,
                0x1234,
            )),
            Payload::Notify(NotifyPayload::new(NotifyType::Cookie.to_u16(), vec![9; 8])),
            Payload::Notify(NotifyPayload::new(60000, Vec::new())),
        ];
        let flags = process_notifies(&payloads);
        assert!(flags.initial_contact);
        assert!(!flags.transport_mode);
        assert_eq!(flags.rekey, Some((ProtocolId::Esp, 0x1234)));
        assert_eq!(flags.cookie, Some(vec![9; 8]));
        assert!(flags.response_error().is_ok());
    }

    #[test]
    fn test_error_notifies() {
        let ts = [error_notify(NotifyType::TsUnacceptable, Vec::new())];
        let flags = process_notifies(&ts);
        assert_eq!(
            flags.response_error(),
            Err(Error::Notified(NotifyType::TsUnacceptable.to_u16()))
        );
        assert!(flags.request_error().is_err());

        // error range but not an aborting type
        let other = [Payload::Notify(NotifyPayload::new(
            NotifyType::TemporaryFailure.to_u16(),
            Vec::new(),
        ))];
        let flags = process_notifies(&other);
        assert!(flags.response_error().is_err());
        assert!(flags.request_error().is_ok());
    }

    #[test]
    fn test_transport_mode_is_mirrored() {
        assert!(mirrored_notifies(&NotifyFlags::default()).is_empty());
        let transport = Payload::Notify(NotifyPayload::new(
            NotifyType::UseTransportMode.to_u16(),
            Vec::new(),
        ));
        let flags = process_notifies(std::slice::from_ref(&transport));
        assert!(flags.transport_mode);
        assert_eq!(mirrored_notifies(&flags), vec![transport]);
    }

    #[test]
    fn test_ike_protocol_is_not_a_child() {
        assert!(ipsec_protocol(ProtocolId::Ike).is_err());
        assert_eq!(ipsec_protocol(ProtocolId::Ah), Ok(IpsecProtocol::Ah));
    }
}
