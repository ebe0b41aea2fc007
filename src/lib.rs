// Chaingate Library
//
// This library provides the core of an operator-facing chat gateway for live
// blockchain telemetry, including:
// - A multiplexer over pluggable tool backends (stdio JSON-RPC subprocesses
//   and remote HTTP JSON-RPC endpoints) with lifecycle supervision
// - A persistent, concurrently-mutated store of tracked pairs, thresholds,
//   subscriptions and one-shot gas alerts, with legacy snapshot migration
// - A background poller that evaluates alert conditions and fans out
//   notifications to subscribed chats
// - An interactive admin console sharing the same mutation surface

pub mod backend;
pub mod config;
pub mod console;
pub mod engine;
pub mod logbuf;
pub mod market;
pub mod notify;
pub mod state;
pub mod subs;
