// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Abstract device transports.
//!
//! Concrete adapters (native sockets talking the real robot line protocol or PLC tag service) and
//! the in-process simulators used by tests both satisfy these traits. Sessions only ever see the
//! trait object - the wire dialect of any one device family is an external collaborator.

pub mod plc;
pub mod robot;

pub use plc::PlcTransport;
pub use robot::RobotTransport;
