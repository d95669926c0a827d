#![no_std]

/// Marker stored in the first word of every [`EchoEvent`].
pub const ECHO_MARKER: u32 = 0x6a61_7221;

/// Event emitted by the echo programs through ring buffers and perf arrays.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EchoEvent {
    pub marker: u32,
    pub value: u32,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for EchoEvent {}
