// Socket front ends that feed bytes into protocol sessions.
pub mod tcp;
pub mod udp;

// Bytes requested per socket read.
pub(crate) const READ_CHUNK: usize = 16 * 1024;
// Largest search datagram accepted.
pub(crate) const MAX_DATAGRAM: usize = 64 * 1024;
