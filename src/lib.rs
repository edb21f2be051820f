// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![deny(missing_debug_implementations, rust_2018_idioms, unused_imports)]
#![allow(dead_code)]

//! A single-host, multi-threaded reactor networking runtime.
//!
//! The core is an event loop ([`evloop::EventLoop`]) built on a readiness
//! [`dispatcher::Dispatcher`], driving [`channel::Channel`]s, a
//! [`timer::TimerWheel`], and a process-wide [`signaler::Signaler`].
//! [`connection::Connection`] is the per-TCP-connection state machine used
//! by both [`server::Server`] and [`client::Client`]; [`listener::Listener`]
//! and [`connector::Connector`] own the accept and connect sides of a
//! socket's lifecycle. [`thread_pool::ThreadPool`] offloads CPU-bound work
//! away from loop threads.
//!
//! Everything above the transport layer (HTTP, MIME, DNS, SMTP, WebSocket)
//! is out of scope: those are thin consumers of this crate.

pub mod buffer;
pub mod channel;
pub mod connection;
pub mod connector;
pub mod dispatcher;
pub mod error;
pub mod evloop;
pub mod evloop_thread;
pub mod listener;
pub mod server;
pub mod client;
pub mod signaler;
pub mod sockops;
pub mod thread_pool;
pub mod timer;
pub mod tls;
pub mod util;

pub use buffer::Buffer;
pub use channel::{Channel, EventSet};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use error::{ReactorError, ReactorResult};
pub use evloop::EventLoop;
pub use server::Server;
pub use client::Client;
