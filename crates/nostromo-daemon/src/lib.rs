//! Keymap daemon for the Belkin Nostromo n50/n52
//!
//! Reads the keypad through evdev, resolves each transition against the
//! active keymap and mode, and plays the resulting keystrokes through a
//! virtual uinput device or a connected forwarding peer.

pub mod context;
pub mod control;
pub mod device;
pub mod dispatcher;
pub mod injector;
pub mod ipc;
pub mod mode;
pub mod remote;
pub mod resolver;
pub mod scheduler;
