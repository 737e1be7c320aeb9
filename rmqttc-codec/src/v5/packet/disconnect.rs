use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, EncodeError};
use crate::utils::{self, Decode, Property};
use crate::v5::{encode::*, property_type as pt, UserProperties, UserProperty};

/// DISCONNECT message
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Disconnect {
    pub reason_code: DisconnectReasonCode,
    pub session_expiry_interval_secs: Option<u32>,
    pub server_reference: Option<ByteString>,
    pub reason_string: Option<ByteString>,
    pub user_properties: UserProperties,
}

prim_enum! {
    /// DISCONNECT reason codes
    #[derive(Deserialize, Serialize)]
    pub enum DisconnectReasonCode {
        NormalDisconnection = 0,
        DisconnectWithWillMessage = 4,
        UnspecifiedError = 128,
        MalformedPacket = 129,
        ProtocolError = 130,
        ImplementationSpecificError = 131,
        NotAuthorized = 135,
        ServerBusy = 137,
        ServerShuttingDown = 139,
        BadAuthenticationMethod = 140,
        KeepAliveTimeout = 141,
        SessionTakenOver = 142,
        TopicFilterInvalid = 143,
        TopicNameInvalid = 144,
        ReceiveMaximumExceeded = 147,
        TopicAliasInvalid = 148,
        PacketTooLarge = 149,
        MessageRateTooHigh = 150,
        QuotaExceeded = 151,
        AdministrativeAction = 152,
        PayloadFormatInvalid = 153,
        RetainNotSupported = 154,
        QosNotSupported = 155,
        UseAnotherServer = 156,
        ServerMoved = 157,
        SharedSubscriptionNotSupported = 158,
        ConnectionRateExceeded = 159,
        MaximumConnectTime = 160,
        SubscriptionIdentifiersNotSupported = 161,
        WildcardSubscriptionsNotSupported = 162
    }
}

impl DisconnectReasonCode {
    #[inline]
    pub fn is_error(&self) -> bool {
        u8::from(*self) >= 0x80
    }
}

impl Disconnect {
    /// Create new instance of `Disconnect` with specified code
    pub fn new(reason_code: DisconnectReasonCode) -> Self {
        Self {
            reason_code,
            session_expiry_interval_secs: None,
            server_reference: None,
            reason_string: None,
            user_properties: Vec::new(),
        }
    }

    pub fn with_reason_string<T: Into<ByteString>>(mut self, reason: T) -> Self {
        self.reason_string = Some(reason.into());
        self
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let disconnect = if src.has_remaining() {
            let reason_code = src.get_u8().try_into()?;

            if src.has_remaining() {
                let mut session_exp_secs = None;
                let mut server_reference = None;
                let mut reason_string = None;
                let mut user_properties = Vec::new();

                let prop_src = &mut utils::take_properties(src)?;
                while prop_src.has_remaining() {
                    match prop_src.get_u8() {
                        pt::SESS_EXPIRY_INT => session_exp_secs.read_value(prop_src)?,
                        pt::REASON_STRING => reason_string.read_value(prop_src)?,
                        pt::USER => user_properties.push(UserProperty::decode(prop_src)?),
                        pt::SERVER_REF => server_reference.read_value(prop_src)?,
                        _ => return Err(DecodeError::MalformedPacket("unexpected disconnect property")),
                    }
                }
                ensure!(!src.has_remaining(), DecodeError::InvalidLength);

                Self {
                    reason_code,
                    session_expiry_interval_secs: session_exp_secs,
                    server_reference,
                    reason_string,
                    user_properties,
                }
            } else {
                Self { reason_code, ..Default::default() }
            }
        } else {
            Self::default()
        };
        Ok(disconnect)
    }
}

impl Default for Disconnect {
    fn default() -> Self {
        Self {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            session_expiry_interval_secs: None,
            server_reference: None,
            reason_string: None,
            user_properties: Vec::new(),
        }
    }
}

impl Disconnect {
    fn properties_len(&self, omit: Omit) -> usize {
        encoded_property_size(&self.session_expiry_interval_secs)
            + encoded_property_size(&self.server_reference)
            + encoded_size_opt_props(&self.user_properties, &self.reason_string, omit)
    }
}

impl EncodeLtd for Disconnect {
    fn encoded_size(&self, omit: Omit) -> usize {
        match self.properties_len(omit) {
            0 if self.reason_code == DisconnectReasonCode::NormalDisconnection => 0,
            0 => 1,
            prop_len => 1 + props_block_size(prop_len),
        }
    }

    fn encode(&self, buf: &mut BytesMut, size: u32, omit: Omit) -> Result<(), EncodeError> {
        if size == 0 {
            return Ok(());
        }
        buf.put_u8(self.reason_code.into());
        if size == 1 {
            return Ok(());
        }

        write_props_len(self.properties_len(omit), buf)?;
        encode_property(&self.session_expiry_interval_secs, pt::SESS_EXPIRY_INT, buf)?;
        encode_property(&self.server_reference, pt::SERVER_REF, buf)?;
        encode_opt_props(&self.user_properties, &self.reason_string, buf, omit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(pkt: &Disconnect, omit: Omit) -> BytesMut {
        let mut buf = BytesMut::new();
        let size = pkt.encoded_size(omit);
        pkt.encode(&mut buf, size as u32, omit).unwrap();
        assert_eq!(buf.len(), size);
        buf
    }

    #[test]
    fn normal_disconnect_is_empty() {
        assert!(encode(&Disconnect::default(), Omit::Nothing).is_empty());
        assert_eq!(Disconnect::decode(&mut Bytes::new()).unwrap(), Disconnect::default());
    }

    #[test]
    fn reason_without_properties() {
        let pkt = Disconnect::new(DisconnectReasonCode::TopicAliasInvalid);
        assert_eq!(&encode(&pkt, Omit::Nothing)[..], b"\x94");
        assert_eq!(Disconnect::decode(&mut Bytes::from_static(b"\x94")).unwrap(), pkt);
    }

    #[test]
    fn reason_string_survives_user_property_trim() {
        let pkt = Disconnect {
            user_properties: vec![("k".into(), "v".into())],
            ..Disconnect::new(DisconnectReasonCode::ProtocolError).with_reason_string("bad")
        };
        assert_eq!(&encode(&pkt, Omit::UserProperties)[..], b"\x82\x06\x1f\x00\x03bad");
        assert_eq!(&encode(&pkt, Omit::ReasonString)[..], b"\x82");

        let pkt = Disconnect { reason_code: DisconnectReasonCode::NormalDisconnection, ..pkt };
        assert!(encode(&pkt, Omit::ReasonString).is_empty());
    }

    #[test]
    fn server_reference_is_decoded() {
        let mut src = Bytes::from_static(b"\x9c\x05\x1c\x00\x02s2");
        let pkt = Disconnect::decode(&mut src).unwrap();
        assert_eq!(pkt.reason_code, DisconnectReasonCode::UseAnotherServer);
        assert_eq!(pkt.server_reference.as_deref(), Some("s2"));
        assert!(pkt.reason_code.is_error());
    }
}
