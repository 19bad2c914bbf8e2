use anyhow::bail;

use crate::protocol::ByteOrder;

pub struct IceConfig {
    /// The vendor string this side announces in `ConnectionSetup` and `ConnectionReply` messages.
    ///  Sub-protocols announce their own vendor string as part of their registration.
    pub vendor: String,
    /// The release string announced alongside [IceConfig::vendor]
    pub release: String,

    /// The byte order in which this side encodes all outgoing messages. This is announced to the
    ///  peer as the very first message on every connection, and the peer decodes everything
    ///  that follows accordingly.
    ///
    /// This defaults to the platform's native byte order. There is no performance reason to
    ///  change it, but it allows talking to a peer in the 'other' byte order on a single machine.
    pub byte_order: ByteOrder,

    /// Initial capacity of a connection's buffer for incoming message bodies. The buffer grows
    ///  on demand up to [IceConfig::max_message_size].
    pub input_buffer_size: usize,
    /// Outgoing messages are collected in a buffer of this size, and written to the transport
    ///  either when the buffer is full or when the connection is flushed explicitly.
    pub output_buffer_size: usize,

    /// Upper limit for the body size of a single incoming message. A peer announcing a bigger
    ///  message is treated as a fatal framing error.
    pub max_message_size: usize,
}

impl Default for IceConfig {
    fn default() -> Self {
        IceConfig {
            vendor: "ice-rs".to_string(),
            release: env!("CARGO_PKG_VERSION").to_string(),
            byte_order: ByteOrder::native(),
            input_buffer_size: 1024,
            output_buffer_size: 1024,
            max_message_size: 16*1024*1024,
        }
    }
}

impl IceConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.vendor.len() > u16::MAX as usize || self.release.len() > u16::MAX as usize {
            bail!("vendor and release strings must be shorter than 64k");
        }
        if self.output_buffer_size < 64 {
            bail!("output buffer size is too small");
        }
        if self.max_message_size < 1024 {
            bail!("max message size must be at least 1024 bytes");
        }
        if self.max_message_size % 8 != 0 {
            bail!("max message size must be a multiple of 8");
        }
        Ok(())
    }
}
