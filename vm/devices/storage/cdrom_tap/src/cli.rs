// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command line entry point.

use crate::media_watch;
use crate::tracing_init;
use anyhow::bail;
use anyhow::Context as _;
use clap::Parser;
use disk_cdrom::protocol;
use disk_cdrom::protocol::MessageHeader;
use disk_cdrom::protocol::OpenBody;
use disk_cdrom::protocol::PacketKind;
use disk_cdrom::CdromDisk;
use disk_cdrom::Device;
use disk_cdrom::HostDrive;
use nix::errno::Errno;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use std::path::PathBuf;
use std::sync::Arc;
use tapdisk::TapDisk;
use tapdisk::TdFlags;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

#[derive(Parser)]
#[clap(name = "cdrom_tap", about = "Virtual CD-ROM backend tools")]
enum Options {
    /// Opens a backing target and prints its media state
    Probe {
        /// Device node or image file
        path: PathBuf,
        /// Open the target read-only
        #[clap(long)]
        read_only: bool,
    },
    /// Runs one backend, reacting to store notifications until killed
    Serve {
        /// Device node or image file
        path: PathBuf,
        /// Store node to publish the backend under
        #[clap(long)]
        node: String,
        /// Open the target read-only
        #[clap(long)]
        read_only: bool,
    },
    /// Publishes host media changes to the backends using each drive
    MediaWatch {
        /// Root of the backend tree in the store
        #[clap(long, default_value = media_watch::DEFAULT_BACKEND_ROOT)]
        backend_root: String,
    },
}

pub(crate) fn main() -> anyhow::Result<()> {
    let opts = Options::parse();
    tracing_init::enable_tracing()?;

    match opts {
        Options::Probe { path, read_only } => probe(path, read_only),
        Options::Serve {
            path,
            node,
            read_only,
        } => serve(path, &node, read_only),
        Options::MediaWatch { backend_root } => {
            let store = xenstore::XsConnection::connect()
                .context("failed to connect to xenstored")?;
            media_watch::run(store, backend_root)
        }
    }
}

fn probe(path: PathBuf, read_only: bool) -> anyhow::Result<()> {
    let mut device = Device::new(Arc::new(HostDrive), &path, read_only);
    device
        .open()
        .with_context(|| format!("failed to open {}", path.display()))?;
    let kind = device.handle().and_then(|(_, kind)| kind);
    let media = device.media();
    println!("path:         {}", path.display());
    println!("kind:         {:?}", kind);
    println!("media:        {}", media.present);
    println!("sectors:      {}", media.sector_count);
    println!("sector size:  {}", media.sector_size);
    Ok(())
}

/// Builds an open notification asking the backend to publish itself under
/// `node`.
fn open_request(node: &str) -> Vec<u8> {
    let header = MessageHeader {
        kind: PacketKind::OPEN.0.into(),
        version: protocol::PROTOCOL_VERSION.into(),
        ret: 0,
        reserved: 0,
        err: 0.into(),
    };
    let mut body = OpenBody::new_zeroed();
    body.payload_offset = ((protocol::HEADER_SIZE + size_of::<OpenBody>()) as u32).into();

    let mut msg = Vec::new();
    msg.extend_from_slice(header.as_bytes());
    msg.extend_from_slice(body.as_bytes());
    msg.extend_from_slice(node.as_bytes());
    msg.push(0);
    msg
}

fn serve(path: PathBuf, node: &str, read_only: bool) -> anyhow::Result<()> {
    let name = path
        .to_str()
        .context("backing path is not valid utf-8")?
        .to_owned();
    let mut disk = CdromDisk::new();
    disk.open(&name, TdFlags::new().with_read_only(read_only))
        .context("failed to open backend")?;

    let mut msg = open_request(node);
    let mut status = 0;
    disk.queue_packet(
        0,
        0,
        &mut msg,
        &mut |completion: tapdisk::Completion| {
            status = completion.status;
            0
        },
        0,
    );
    if status != 0 {
        bail!("open notification failed: {}", Errno::from_raw(-status));
    }
    let header = protocol::read_header(&msg)?;
    if header.ret != 0 {
        bail!(
            "open notification rejected: {}",
            Errno::from_raw(-header.err.get())
        );
    }
    let reply = OpenBody::read_from_prefix(&msg[protocol::HEADER_SIZE..])
        .map_err(|_| anyhow::anyhow!("truncated open reply"))?
        .0;
    tracing::info!(
        node,
        media = reply.media_present != 0,
        sectors = reply.sectors.get(),
        sector_size = reply.sector_size.get(),
        "backend published"
    );

    loop {
        if !disk.has_pending_notification() {
            let fd = disk
                .notification_fd()
                .context("store connection has no notification fd")?;
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            match nix::poll::poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("failed to poll store connection"),
            }
            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                bail!("store connection closed");
            }
        }
        disk.do_callbacks(0);
    }
}
