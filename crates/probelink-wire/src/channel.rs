//! Channel IDs used on the device link.

/// Handshake, registration, configuration and status replies.
pub const CONTROL: u16 = 0;

/// Unsolicited frame data pushed by the device service.
pub const DATA: u16 = 2;

/// Returns a human-readable name for a channel ID.
pub fn channel_name(id: u16) -> &'static str {
    match id {
        CONTROL => "CONTROL",
        DATA => "DATA",
        _ => "UNKNOWN",
    }
}
