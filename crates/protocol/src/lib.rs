//! Wire types: the worker IPC protocol (newline-delimited JSON over
//! stdio) and the client WebSocket frame envelope.

mod client;
mod worker;

pub use client::{
    ClientFrame, ErrorPayload, FrameType, SpawnPayload, SubscribePayload, TaskPayload,
    CLOSE_GOING_AWAY, CLOSE_OVERLOAD, CLOSE_POLICY,
};
pub use worker::{TaskStatus, ToolSpec, WorkerMessage, MAX_IPC_FRAME_BYTES};
