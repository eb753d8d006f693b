use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::{self, Worker};
use crate::session::{self, Session};
use crate::transport::ChannelTransport;

/// How often the session is polled while a command runs.
const TICK: Duration = Duration::from_millis(20);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not start the async runtime")]
    Runtime(#[source] std::io::Error),
    #[error("could not connect to the controller")]
    Connect(#[source] connection::Error),
    #[error("the connection worker failed")]
    Worker(#[source] connection::Error),
    #[error("the connection worker panicked")]
    WorkerPanic(#[source] tokio::task::JoinError),
    #[error("could not produce the output")]
    Output(#[source] crate::output::Error),
    #[error("register transfer failed")]
    Transfer(#[source] session::Error),
    #[error("could not open the capture file")]
    Capture(#[source] crate::capture::Error),
    #[error("the connection to the controller was lost")]
    LinkLost,
    #[error("timed out while {0}")]
    Timeout(&'static str),
    #[error("the controller does not know a register named `{0}`")]
    UnknownRegister(String),
    #[error("register `{0}` is read-only")]
    ReadOnly(String),
    #[error("the controller refused: {0}")]
    Refused(String),
}

#[derive(clap::Parser, Clone)]
#[group(id = "commands::LinkArgs")]
pub struct LinkArgs {
    #[clap(flatten)]
    connection: connection::Args,

    /// Give up on the command if it does not complete within this amount of time.
    #[arg(long, default_value = "10s")]
    timeout: humantime::Duration,
}

/// A session driven by the tokio timer.
struct Link {
    session: Session<ChannelTransport>,
    worker: Worker,
    epoch: Instant,
    ticker: tokio::time::Interval,
    deadline: Instant,
}

impl Link {
    fn connect(args: &LinkArgs) -> Result<Self, Error> {
        let (transport, worker) = connection::open(&args.connection).map_err(Error::Connect)?;
        let session = Session::open(transport, args.connection.session_config());
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let epoch = Instant::now();
        Ok(Self { session, worker, epoch, ticker, deadline: epoch + *args.timeout })
    }

    fn clock(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    async fn tick(&mut self) -> Result<(), Error> {
        self.ticker.tick().await;
        let clock = self.clock();
        self.session.fetch(clock);
        self.session.push();
        if !self.session.is_open() {
            return Err(Error::LinkLost);
        }
        if self.session.take_uptime_warning() {
            warn!(message = "the controller has restarted");
        }
        Ok(())
    }

    /// Drive the session until `done` holds.
    async fn until(
        &mut self,
        what: &'static str,
        mut done: impl FnMut(&mut Session<ChannelTransport>) -> bool,
    ) -> Result<(), Error> {
        debug!(message = "waiting", what);
        loop {
            if done(&mut self.session) {
                return Ok(());
            }
            if Instant::now() > self.deadline {
                return Err(Error::Timeout(what));
            }
            self.tick().await?;
        }
    }

    /// Send `text` as soon as the session accepts it.
    async fn command(&mut self, text: &str) -> Result<(), Error> {
        self.until("sending a command", |s| s.command(text)).await
    }

    /// Have the controller list its registers and wait for the list to end.
    async fn load_registers(&mut self) -> Result<(), Error> {
        self.until("asking for the register list", Session::announce).await?;
        let quiet = u64::try_from(self.session.config().capture_timeout.as_millis()).unwrap_or(u64::MAX);
        self.until("receiving the register list", |s| {
            s.registers().max_n() > 0 && s.silence() > quiet
        })
        .await?;
        info!(message = "register list received", count = self.session.registers().iter().count());
        Ok(())
    }

    fn check_refusal(&mut self) -> Result<(), Error> {
        match self.session.take_warning() {
            Some(warning) => Err(Error::Refused(warning)),
            None => Ok(()),
        }
    }

    async fn finish(self) -> Result<(), Error> {
        let Self { session, worker, .. } = self;
        drop(session);
        worker.await.map_err(Error::WorkerPanic)?.map_err(Error::Worker)
    }
}

fn runtime_block_on<F: std::future::Future<Output = Result<(), Error>>>(
    future: F,
) -> Result<(), Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(Error::Runtime)?;
    runtime.block_on(future)
}

pub mod registers {
    use super::{Error, Link, LinkArgs, runtime_block_on};
    use crate::output::{self, REGISTER_HEADERS, RegisterRecord};

    /// List the registers the controller exposes.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        link: LinkArgs,
        #[clap(flatten)]
        output: output::Args,
        /// Only list registers whose symbol contains this text.
        filter: Option<String>,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        runtime_block_on(async move {
            let mut link = Link::connect(&args.link)?;
            link.load_registers().await?;
            let mut output = args.output.to_output().map_err(Error::Output)?;
            output.table_headers(REGISTER_HEADERS).map_err(Error::Output)?;
            for (id, register) in link.session.registers().iter() {
                if let Some(filter) = &args.filter {
                    if !register.symbol.contains(filter.as_str()) {
                        continue;
                    }
                }
                output.register(&RegisterRecord::new(id, register)).map_err(Error::Output)?;
            }
            output.commit().map_err(Error::Output)?;
            link.finish().await
        })
    }
}

pub mod read {
    use super::{Error, Link, LinkArgs, runtime_block_on};
    use crate::output::{self, REGISTER_HEADERS, RegisterRecord};

    /// Read the current value of registers.
    ///
    /// A symbol ending in `.` reads every register of that group, e.g. `pm.` for all of `pm.*`.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        link: LinkArgs,
        #[clap(flatten)]
        output: output::Args,
        #[arg(required = true)]
        symbols: Vec<String>,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        runtime_block_on(async move {
            let mut link = Link::connect(&args.link)?;
            link.load_registers().await?;
            let mut ids = Vec::new();
            for symbol in &args.symbols {
                let range = if symbol.ends_with('.') {
                    link.session.lookup_range(symbol)
                } else {
                    link.session.registers().lookup_id(symbol).map(|id| (id, id))
                };
                let Some((first, last)) = range else {
                    return Err(Error::UnknownRegister(symbol.clone()));
                };
                ids.extend(first..=last);
            }
            let requested = link.session.clock();
            for &id in &ids {
                if let Some(register) = link.session.registers_mut().get_mut(id) {
                    register.shown = requested;
                    register.one_shot = true;
                }
            }
            link.until("reading the registers", |s| {
                ids.iter().all(|&id| s.registers().get(id).is_none_or(|r| r.fetched > requested))
            })
            .await?;
            let mut output = args.output.to_output().map_err(Error::Output)?;
            output.table_headers(REGISTER_HEADERS).map_err(Error::Output)?;
            for &id in &ids {
                let Some(register) = link.session.registers().get(id) else { continue };
                output.register(&RegisterRecord::new(id, register)).map_err(Error::Output)?;
            }
            output.commit().map_err(Error::Output)?;
            link.finish().await
        })
    }
}

pub mod write {
    use super::{Error, Link, LinkArgs, runtime_block_on};

    /// Change the value of a register.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        link: LinkArgs,
        symbol: String,
        value: String,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        runtime_block_on(async move {
            let mut link = Link::connect(&args.link)?;
            link.load_registers().await?;
            let Some(register) = link.session.lookup(&args.symbol) else {
                return Err(Error::UnknownRegister(args.symbol));
            };
            if !register.mode.is_writable() {
                return Err(Error::ReadOnly(args.symbol));
            }
            link.session.edit(&args.symbol, &args.value);
            let symbol = args.symbol.as_str();
            link.until("writing the register", |s| {
                s.lookup(symbol).is_none_or(|r| !r.is_pending_write() && r.queued == 0)
            })
            .await?;
            link.check_refusal()?;
            if let Some(register) = link.session.lookup(&args.symbol) {
                println!("{} = {} {}", register.symbol, register.value(), register.unit);
            }
            link.finish().await
        })
    }
}

pub mod export {
    use std::path::PathBuf;

    use super::{Error, Link, LinkArgs, runtime_block_on};

    /// Save the configuration registers into a file that `import` can load.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        link: LinkArgs,
        file: PathBuf,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        runtime_block_on(async move {
            let mut link = Link::connect(&args.link)?;
            link.load_registers().await?;
            let count = link.session.export_to(&args.file).map_err(Error::Transfer)?;
            eprintln!("exported {count} registers to {}", args.file.display());
            link.finish().await
        })
    }
}

pub mod import {
    use std::path::PathBuf;

    use super::{Error, Link, LinkArgs, runtime_block_on};

    /// Write the registers listed in a file produced by `export`.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        link: LinkArgs,
        file: PathBuf,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        runtime_block_on(async move {
            let mut link = Link::connect(&args.link)?;
            link.load_registers().await?;
            let count = link.session.import_from(&args.file).map_err(Error::Transfer)?;
            link.until("writing the registers", |s| {
                s.registers().iter().all(|(_, r)| !r.is_pending_write() && r.queued == 0)
            })
            .await?;
            link.check_refusal()?;
            eprintln!("imported {count} registers from {}", args.file.display());
            link.finish().await
        })
    }
}

pub mod capture {
    use std::path::PathBuf;

    use super::{Error, Link, LinkArgs, runtime_block_on};

    /// Run a command with a bulk reply (telemetry, logs) and save the reply into a file.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        link: LinkArgs,
        /// The command to run, e.g. `tlm_flush_sync`.
        command: String,
        /// Where to save the reply. Defaults to a timestamped file in the current directory.
        #[arg(long, short = 'o')]
        file: Option<PathBuf>,
    }

    fn default_path() -> PathBuf {
        let now = jiff::Zoned::now();
        PathBuf::from(format!("pmc-{}.txt", now.strftime("%Y%m%d-%H%M%S")))
    }

    pub fn run(args: Args) -> Result<(), Error> {
        runtime_block_on(async move {
            let mut link = Link::connect(&args.link)?;
            let path = args.file.unwrap_or_else(default_path);
            link.session.try_open_capture(&path).map_err(Error::Capture)?;
            link.command(&args.command).await?;
            link.until("waiting for the reply to start", |s| s.is_capturing()).await?;
            link.until("receiving the reply", |s| !s.is_capturing()).await?;
            link.session.close_capture();
            link.check_refusal()?;
            eprintln!("captured {} lines into {}", link.session.capture_lines(), path.display());
            link.finish().await
        })
    }
}

pub mod exec {
    use std::time::Duration;

    use super::{Error, Link, LinkArgs, runtime_block_on};
    use crate::dispatch::FlashBlock;

    /// Run a command and report what the controller replied.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        link: LinkArgs,
        command: String,
        /// How long to collect the reply for.
        #[arg(long, default_value = "1s")]
        wait: humantime::Duration,
    }

    fn flash_row(row: &[FlashBlock]) -> String {
        row.iter()
            .map(|block| match block {
                FlashBlock::Used => 'x',
                FlashBlock::Active => 'a',
                FlashBlock::Empty => '.',
            })
            .collect()
    }

    pub fn run(args: Args) -> Result<(), Error> {
        runtime_block_on(async move {
            let mut link = Link::connect(&args.link)?;
            link.command(&args.command).await?;
            let wait: Duration = *args.wait;
            let stop = tokio::time::Instant::now() + wait;
            link.until("collecting the reply", |_| tokio::time::Instant::now() >= stop).await?;
            link.check_refusal()?;
            if let Some(origin) = link.session.origin() {
                println!("origin: {origin}");
            }
            let info = link.session.hardware_info();
            if !info.is_empty() {
                println!("{info}");
            }
            for node in link.session.survey() {
                println!("node {} uid {:08X}", node.node_id, node.uid);
            }
            for (index, row) in link.session.flash_map().iter().enumerate() {
                println!("{index:2} {}", flash_row(row));
            }
            link.finish().await
        })
    }
}
