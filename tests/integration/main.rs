//! Ferry integration test harness.
//!
//! Everything here runs in-process over real loopback UDP sockets: a
//! library receiver (and, where a test wants one, a link emulator) is
//! spawned as a task on an OS-assigned port, and senders push real files
//! at it. No external processes, no fixed ports, safe to run in parallel.


mod faults;
mod transfer;
