// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tools for the virtual CD-ROM backend: probing a backing target, running
//! a single backend against the local xenstored, and publishing host media
//! changes to running backends.

#[cfg(target_os = "linux")]
mod cli;
#[cfg(target_os = "linux")]
mod media_watch;
#[cfg(target_os = "linux")]
mod tracing_init;

#[cfg(not(target_os = "linux"))]
fn main() {
    unimplemented!("cdrom_tap only runs on Linux");
}

#[cfg(target_os = "linux")]
use cli::main;
