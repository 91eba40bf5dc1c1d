//! Basic-class content properties and the content header frame payload.

use bytes::{BufMut, Bytes, BytesMut};

use super::field_table::FieldTable;
use super::method::class;
use super::wire::put_short_str;
use crate::error::Result;

/// Property flag bits, highest bit first in wire order.
mod flag {
    pub const CONTENT_TYPE: u16 = 1 << 15;
    pub const CONTENT_ENCODING: u16 = 1 << 14;
    pub const HEADERS: u16 = 1 << 13;
    pub const DELIVERY_MODE: u16 = 1 << 12;
    pub const PRIORITY: u16 = 1 << 11;
    pub const CORRELATION_ID: u16 = 1 << 10;
    pub const REPLY_TO: u16 = 1 << 9;
    pub const EXPIRATION: u16 = 1 << 8;
    pub const MESSAGE_ID: u16 = 1 << 7;
    pub const TIMESTAMP: u16 = 1 << 6;
    pub const TYPE: u16 = 1 << 5;
    pub const USER_ID: u16 = 1 << 4;
    pub const APP_ID: u16 = 1 << 3;
    pub const CLUSTER_ID: u16 = 1 << 2;
}

/// Basic-class message properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicProperties {
    /// MIME content type
    pub content_type: Option<String>,
    /// MIME content encoding
    pub content_encoding: Option<String>,
    /// Application headers
    pub headers: Option<FieldTable>,
    /// 1 = transient, 2 = persistent
    pub delivery_mode: Option<u8>,
    /// Message priority, 0 to 9
    pub priority: Option<u8>,
    /// Application correlation identifier
    pub correlation_id: Option<String>,
    /// Address to reply to
    pub reply_to: Option<String>,
    /// Message expiration
    pub expiration: Option<String>,
    /// Application message identifier
    pub message_id: Option<String>,
    /// Message timestamp (seconds)
    pub timestamp: Option<u64>,
    /// Message type name
    pub kind: Option<String>,
    /// Creating user id
    pub user_id: Option<String>,
    /// Creating application id
    pub app_id: Option<String>,
    /// Intra-cluster routing identifier
    pub cluster_id: Option<String>,
}

impl BasicProperties {
    /// Set the content type
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    /// Set one application header
    pub fn with_header(
        mut self,
        key: impl Into<String>,
        value: impl Into<super::FieldValue>,
    ) -> Self {
        self.headers.get_or_insert_with(FieldTable::new).insert(key, value);
        self
    }

    /// Set the delivery mode
    pub fn with_delivery_mode(mut self, mode: u8) -> Self {
        self.delivery_mode = Some(mode);
        self
    }

    /// Set the message id
    pub fn with_message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_string());
        self
    }

    /// Set the reply-to address
    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_string());
        self
    }

    /// Property flag word for the fields that are present.
    pub fn flags(&self) -> u16 {
        let mut flags = 0u16;
        let mut set = |present: bool, bit: u16| {
            if present {
                flags |= bit;
            }
        };
        set(self.content_type.is_some(), flag::CONTENT_TYPE);
        set(self.content_encoding.is_some(), flag::CONTENT_ENCODING);
        set(self.headers.is_some(), flag::HEADERS);
        set(self.delivery_mode.is_some(), flag::DELIVERY_MODE);
        set(self.priority.is_some(), flag::PRIORITY);
        set(self.correlation_id.is_some(), flag::CORRELATION_ID);
        set(self.reply_to.is_some(), flag::REPLY_TO);
        set(self.expiration.is_some(), flag::EXPIRATION);
        set(self.message_id.is_some(), flag::MESSAGE_ID);
        set(self.timestamp.is_some(), flag::TIMESTAMP);
        set(self.kind.is_some(), flag::TYPE);
        set(self.user_id.is_some(), flag::USER_ID);
        set(self.app_id.is_some(), flag::APP_ID);
        set(self.cluster_id.is_some(), flag::CLUSTER_ID);
        flags
    }

    /// Append flag word and property list to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u16(self.flags());

        let short = |buf: &mut BytesMut, v: &Option<String>| -> Result<()> {
            match v {
                Some(s) => put_short_str(buf, s),
                None => Ok(()),
            }
        };

        short(buf, &self.content_type)?;
        short(buf, &self.content_encoding)?;
        if let Some(headers) = &self.headers {
            headers.encode(buf)?;
        }
        if let Some(mode) = self.delivery_mode {
            buf.put_u8(mode);
        }
        if let Some(priority) = self.priority {
            buf.put_u8(priority);
        }
        short(buf, &self.correlation_id)?;
        short(buf, &self.reply_to)?;
        short(buf, &self.expiration)?;
        short(buf, &self.message_id)?;
        if let Some(ts) = self.timestamp {
            buf.put_u64(ts);
        }
        short(buf, &self.kind)?;
        short(buf, &self.user_id)?;
        short(buf, &self.app_id)?;
        short(buf, &self.cluster_id)?;
        Ok(())
    }
}

/// Content header frame payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    /// Content class (always basic for the core)
    pub class_id: u16,
    /// Total body size in bytes
    pub body_size: u64,
    /// Message properties
    pub properties: BasicProperties,
}

impl ContentHeader {
    /// Basic-class header for a body of `body_size` bytes
    pub fn basic(body_size: u64, properties: BasicProperties) -> Self {
        Self {
            class_id: class::BASIC,
            body_size,
            properties,
        }
    }

    /// Encode to a fresh payload buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(self.class_id);
        buf.put_u16(0); // weight, unused
        buf.put_u64(self.body_size);
        self.properties.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_empty_properties_header() {
        let header = ContentHeader::basic(5, BasicProperties::default());
        let bytes = header.encode().unwrap();
        assert_eq!(&bytes[..], &hex!("003c 0000 0000000000000005 0000"));
    }

    #[test]
    fn test_flags_follow_wire_order() {
        let props = BasicProperties::default()
            .with_content_type("text/plain")
            .with_delivery_mode(2);
        assert_eq!(props.flags(), 0x9000);

        let bytes = ContentHeader::basic(0, props).encode().unwrap();
        // class, weight, size, flags, "text/plain", mode
        assert_eq!(&bytes[12..14], &hex!("9000"));
        assert_eq!(bytes[14], 10);
        assert_eq!(&bytes[15..25], b"text/plain");
        assert_eq!(bytes[25], 2);
        assert_eq!(bytes.len(), 26);
    }

    #[test]
    fn test_headers_table_encoded() {
        let props = BasicProperties::default().with_header("x-retry", 3i32);
        assert_eq!(props.flags(), 0x2000);
        let bytes = ContentHeader::basic(0, props).encode().unwrap();
        // table length = 1 + 7 ("x-retry") + 1 + 4
        assert_eq!(&bytes[14..18], &hex!("0000000d"));
    }

    #[test]
    fn test_malformed_property_fails() {
        let props = BasicProperties::default().with_reply_to(&"r".repeat(300));
        assert!(ContentHeader::basic(0, props).encode().is_err());
    }
}
