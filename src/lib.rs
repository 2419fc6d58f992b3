//! # ArmCam Node Library
//!
//! Camera observation node for a robotic arm.
//!
//! Captures JPEG frames, pairs each with the arm's telemetry, and delivers
//! the result as batched HTTP pushes (with an on-disk spool when the server
//! is unreachable) or as a live multipart stream. Remote commands arrive
//! over MQTT.

pub mod backoff;
pub mod bus;
pub mod camera;
pub mod command;
pub mod config;
pub mod encoder;
pub mod error;
pub mod manipulator;
pub mod pipeline;
pub mod stream;
pub mod telemetry;
