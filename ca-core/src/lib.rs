// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Transport-agnostic Channel Access server core: buffer management,
//! resource/async-I/O bookkeeping, flow-controlled event delivery, and the
//! stream/datagram client state machines. Everything that talks to an
//! actual socket, or to actual process variables, lives outside this
//! crate; see the `Source`/`Sink` and `Adapter` traits for the seams.

pub mod adapter;
pub mod async_io;
pub mod buf;
pub mod channel;
pub mod client;
pub mod dd;
pub mod error;
pub mod event_queue;
pub mod monitor;
pub mod resource_table;
pub mod server;

pub use adapter::{Adapter, ClientMailbox, Completion, CompletionToken};
pub use channel::Chan;
pub use client::datagram::DatagramClient;
pub use client::StreamClient;
pub use dd::{Dd, DdHandle};
pub use error::Error;
pub use event_queue::EventQueue;
pub use monitor::{EventMask, Monitor, MonitorId};
pub use resource_table::{ResourceId, ResourceTable};
pub use server::{new_shared_server_core, ServerCore, SharedServerCore};
