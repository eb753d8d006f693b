use crate::codec::LineCodec;
use crate::session::SessionConfig;
use crate::transport::{self, ChannelTransport, Peer};
use futures::{SinkExt as _, StreamExt as _};
use std::path::PathBuf;
use tokio_serial::{SerialPortBuilderExt as _, SerialStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the serial port `{1}`")]
    OpenPort(#[source] tokio_serial::Error, String),
    #[error("could not read data from the serial port")]
    Receive(#[source] std::io::Error),
    #[error("could not send out the command")]
    Send(#[source] std::io::Error),
    #[error("could not shut down the connection")]
    Shutdown(#[source] std::io::Error),
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// The serial port the controller is attached to (e.g. `/dev/ttyUSB0`).
    #[arg(long, short = 'p')]
    port: String,

    /// The baudrate configured on the controller's console.
    #[arg(long, default_value = "57600")]
    baudrate: u32,

    /// Minimum spacing between two commands sent to the controller.
    #[arg(long, default_value = "10ms")]
    quantum: humantime::Duration,

    /// Give up on a register request that has not been answered within this amount of time.
    ///
    /// The register becomes eligible to be requested again.
    #[arg(long, default_value = "1s")]
    request_timeout: humantime::Duration,

    /// Probe the controller when it has not said anything for this long.
    #[arg(long, default_value = "1s")]
    keepalive: humantime::Duration,

    /// Consider the connection lost once the controller has been silent for this long.
    #[arg(long, default_value = "5s")]
    link_timeout: humantime::Duration,

    /// Consider a bulk reply (telemetry, logs) finished after this much silence.
    #[arg(long, default_value = "500ms")]
    capture_timeout: humantime::Duration,

    /// Read-only registers on display are refreshed at least this often.
    #[arg(long, default_value = "10s")]
    read_only_refresh: humantime::Duration,

    /// The command sent to a quiet controller to check that it is still there.
    ///
    /// Its reply carries the controller's clock, which is used to detect restarts.
    #[arg(long, default_value = "ap_clock")]
    keepalive_command: String,

    /// The command which makes the controller list all of its registers.
    #[arg(long, default_value = "reg")]
    announce_command: String,

    /// Where bulk replies are saved unless a command says otherwise.
    #[arg(long, default_value = "pmc-capture.txt")]
    capture_path: PathBuf,

    /// The number of lines buffered in each direction between the port and the session.
    #[arg(long, default_value = "256")]
    queue_depth: usize,
}

impl Args {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            quantum: *self.quantum,
            request_timeout: *self.request_timeout,
            keepalive: *self.keepalive,
            link_timeout: *self.link_timeout,
            capture_timeout: *self.capture_timeout,
            read_only_refresh: *self.read_only_refresh,
            keepalive_command: self.keepalive_command.clone(),
            announce_command: self.announce_command.clone(),
            capture_path: self.capture_path.clone(),
        }
    }
}

pub type Worker = tokio::task::JoinHandle<Result<(), Error>>;

/// Open the serial port and start shuttling lines between it and the returned transport.
///
/// The worker ends when either the port reaches end of file or the transport is dropped.
pub fn open(args: &Args) -> Result<(ChannelTransport, Worker), Error> {
    info!(message = "opening serial port", port = args.port, baudrate = args.baudrate);
    let stream = tokio_serial::new(&args.port, args.baudrate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| Error::OpenPort(e, args.port.clone()))?;
    let (transport, peer) = transport::channel(args.queue_depth);
    let worker = tokio::task::spawn(main_loop(Framed::new(stream, LineCodec::default()), peer));
    Ok((transport, worker))
}

type SerialIo = Framed<SerialStream, LineCodec>;

async fn main_loop(io: SerialIo, mut peer: Peer) -> Result<(), Error> {
    let (mut io_sink, mut io_source) = io.split();
    loop {
        tokio::select! {
            line = io_source.next() => {
                let Some(line) = line else {
                    info!(message = "serial port reached end of file");
                    return Ok(());
                };
                let line = line.map_err(Error::Receive)?;
                trace!(message = "line from the port", line);
                if peer.inbound.send(line).await.is_err() {
                    debug!(message = "session went away, closing the port");
                    return io_sink.close().await.map_err(Error::Shutdown);
                }
            }
            command = peer.outbound.recv() => {
                let Some(command) = command else {
                    debug!(message = "session went away, closing the port");
                    return io_sink.close().await.map_err(Error::Shutdown);
                };
                trace!(message = "line to the port", line = command);
                io_sink.send(command).await.map_err(Error::Send)?;
            }
        }
    }
}
