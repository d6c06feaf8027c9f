//! Connection-class method bodies

use bytes::{Buf, BufMut, Bytes};

use crate::error::DecodeError;
use crate::primitives::{FieldTable, LongString, ShortString};

/// `Connection.Start` — opens version negotiation and advertises the
/// server identity, SASL mechanisms and locales.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStart {
    /// Protocol major version the server speaks
    pub version_major: u8,

    /// Protocol minor version the server speaks
    pub version_minor: u8,

    /// Server properties: product, version, capability flags
    pub server_properties: FieldTable,

    /// Space-separated SASL mechanism names
    pub mechanisms: LongString,

    /// Space-separated message locales
    pub locales: LongString,
}

impl ConnectionStart {
    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.version_major);
        dst.put_u8(self.version_minor);
        self.server_properties.encode(dst);
        self.mechanisms.encode(dst);
        self.locales.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        crate::error::ensure(src, 2)?;
        Ok(Self {
            version_major: src.get_u8(),
            version_minor: src.get_u8(),
            server_properties: FieldTable::decode(src)?,
            mechanisms: LongString::decode(src)?,
            locales: LongString::decode(src)?,
        })
    }
}

/// `Connection.Start-Ok` — the client's identity, chosen mechanism and
/// initial SASL response.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStartOk {
    /// Client properties: product, version, capability flags
    pub client_properties: FieldTable,

    /// Chosen SASL mechanism
    pub mechanism: ShortString,

    /// Initial SASL response octets
    pub response: LongString,

    /// Chosen locale
    pub locale: ShortString,
}

impl ConnectionStartOk {
    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        self.client_properties.encode(dst);
        self.mechanism.encode(dst);
        self.response.encode(dst);
        self.locale.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            client_properties: FieldTable::decode(src)?,
            mechanism: ShortString::decode(src)?,
            response: LongString::decode(src)?,
            locale: ShortString::decode(src)?,
        })
    }
}

/// `Connection.Secure` — a SASL challenge to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSecure {
    /// Challenge octets, mechanism-specific
    pub challenge: LongString,
}

impl ConnectionSecure {
    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        self.challenge.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            challenge: LongString::decode(src)?,
        })
    }
}

/// `Connection.Secure-Ok` — the client's answer to a challenge.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSecureOk {
    /// Response octets, mechanism-specific
    pub response: LongString,
}

impl ConnectionSecureOk {
    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        self.response.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            response: LongString::decode(src)?,
        })
    }
}

/// `Connection.Tune` / `Connection.Tune-Ok` — both carry the same triple,
/// so one body serves both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTune {
    /// Highest channel id the sender accepts; zero means no limit stated
    pub channel_max: u16,

    /// Largest frame the sender accepts, octets; zero means no limit stated
    pub frame_max: u32,

    /// Desired heartbeat delay, seconds; zero disables heartbeats
    pub heartbeat: u16,
}

impl ConnectionTune {
    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u16(self.channel_max);
        dst.put_u32(self.frame_max);
        dst.put_u16(self.heartbeat);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        crate::error::ensure(src, 8)?;
        Ok(Self {
            channel_max: src.get_u16(),
            frame_max: src.get_u32(),
            heartbeat: src.get_u16(),
        })
    }
}

/// `Connection.Open` — attaches the connection to a virtual host.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOpen {
    /// Virtual host path, e.g. `/`
    pub virtual_host: ShortString,

    /// Reserved capability string
    pub capabilities: ShortString,

    /// Reserved insist flag
    pub insist: bool,
}

impl ConnectionOpen {
    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        self.virtual_host.encode(dst);
        self.capabilities.encode(dst);
        dst.put_u8(self.insist as u8);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let virtual_host = ShortString::decode(src)?;
        let capabilities = ShortString::decode(src)?;
        crate::error::ensure(src, 1)?;
        Ok(Self {
            virtual_host,
            capabilities,
            insist: src.get_u8() & 1 != 0,
        })
    }
}

/// `Connection.Open-Ok`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionOpenOk {
    /// Reserved known-hosts string; carries a redirect host on 0-8
    pub known_hosts: ShortString,
}

impl ConnectionOpenOk {
    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        self.known_hosts.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            known_hosts: ShortString::decode(src)?,
        })
    }
}

/// `Connection.Close` — either peer requests connection shutdown, citing
/// the method that provoked it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionClose {
    /// Reply code
    pub reply_code: u16,

    /// Human-readable reason
    pub reply_text: ShortString,

    /// Class id of the offending method, zero when none
    pub class_id: u16,

    /// Method id of the offending method, zero when none
    pub method_id: u16,
}

impl ConnectionClose {
    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u16(self.reply_code);
        self.reply_text.encode(dst);
        dst.put_u16(self.class_id);
        dst.put_u16(self.method_id);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        crate::error::ensure(src, 2)?;
        let reply_code = src.get_u16();
        let reply_text = ShortString::decode(src)?;
        crate::error::ensure(src, 4)?;
        Ok(Self {
            reply_code,
            reply_text,
            class_id: src.get_u16(),
            method_id: src.get_u16(),
        })
    }
}
