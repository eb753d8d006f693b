//! A connection to one device.
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::capture::{self, Capture};
use crate::dispatch::{DispatchMode, Dispatcher, FlashBlock, HwInfo, Origin, Step, SurveyNode};
use crate::lexer::Cursor;
use crate::registers::{Mode, Register, RegisterTable};
use crate::scheduler::{Scheduler, quote_value};
use crate::transport::{self, Transport};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not write the register export to {1:?}")]
    Export(#[source] std::io::Error, PathBuf),
    #[error("could not read the register import from {1:?}")]
    Import(#[source] std::io::Error, PathBuf),
}

/// Timing and naming knobs of a [`Session`].
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Minimum spacing between two outbound commands.
    pub quantum: Duration,
    /// A request without a reply for this long is given up on.
    pub request_timeout: Duration,
    /// Probe the device when it has been quiet for this long.
    pub keepalive: Duration,
    /// Consider the link dead when the device has been silent for this long.
    pub link_timeout: Duration,
    /// Consider a bulk reply complete when no line arrived for this long.
    pub capture_timeout: Duration,
    /// Read-only registers on display are refreshed at least this often.
    pub read_only_refresh: Duration,
    pub keepalive_command: String,
    /// Sent by [`Session::announce`] to make the device list its registers.
    pub announce_command: String,
    /// Where bulk replies go when the application has not opened a capture itself.
    pub capture_path: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            quantum: Duration::from_millis(10),
            request_timeout: Duration::from_millis(1000),
            keepalive: Duration::from_secs(1),
            link_timeout: Duration::from_secs(5),
            capture_timeout: Duration::from_millis(500),
            read_only_refresh: Duration::from_secs(10),
            keepalive_command: "ap_clock".to_string(),
            announce_command: "reg".to_string(),
            capture_path: PathBuf::from("pmc-capture.txt"),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub struct Session<T> {
    transport: Option<T>,
    config: SessionConfig,
    clock: u64,
    /// No outbound command before this time.
    locked: u64,
    /// Last time a line arrived.
    active: u64,
    /// Last time the device showed signs of life or was pinged.
    keep_alive: u64,
    started: bool,
    table: RegisterTable,
    dispatcher: Dispatcher,
    scheduler: Scheduler,
    capture: Capture,
}

impl<T: Transport> Session<T> {
    pub fn open(transport: T, config: SessionConfig) -> Self {
        info!(message = "session opened");
        let dispatcher =
            Dispatcher::new(config.keepalive_command.clone(), config.capture_path.clone());
        Self {
            transport: Some(transport),
            config,
            clock: 0,
            locked: 0,
            active: 0,
            keep_alive: 0,
            started: false,
            table: RegisterTable::new(),
            dispatcher,
            scheduler: Scheduler::default(),
            capture: Capture::default(),
        }
    }

    /// Drop the transport and everything learned from the device.
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            info!(message = "session closed");
        }
        self.reset();
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Discard the register table and protocol state but keep the transport open.
    pub fn reset(&mut self) {
        self.capture.close();
        self.table.clear();
        self.dispatcher.reset();
        self.scheduler.reset();
        self.locked = 0;
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Milliseconds since the last line was received.
    pub fn silence(&self) -> u64 {
        self.clock.saturating_sub(self.active)
    }

    /// Process every line available from the transport and run the liveness checks.
    ///
    /// `clock_ms` is the caller's monotonic clock; it never goes backwards from the point of
    /// view of the session.
    pub fn fetch(&mut self, clock_ms: u64) -> usize {
        self.clock = self.clock.max(clock_ms);
        let Some(transport) = &mut self.transport else {
            return 0;
        };
        if !self.started {
            self.started = true;
            self.active = self.clock;
            self.keep_alive = self.clock;
        }
        let mut count = 0;
        loop {
            let line = match transport.try_read_line() {
                Ok(line) => line,
                Err(transport::Error::WouldBlock) => break,
                Err(transport::Error::Closed) => {
                    warn!(message = "transport closed by the other end");
                    self.close();
                    return count;
                }
            };
            count += 1;
            self.active = self.clock;
            self.keep_alive = self.clock;
            trace!(message = "received", line);
            let step = self.dispatcher.dispatch(&line, &mut self.table, &mut self.capture, self.clock);
            if let Step::RemoteHop(origin) = step {
                debug!(message = "scheduler reset after hop", %origin);
                self.scheduler.reset();
            }
        }
        self.check_liveness();
        count
    }

    fn check_liveness(&mut self) {
        let silence = self.clock.saturating_sub(self.active);
        if self.dispatcher.mode() == DispatchMode::BulkCapture {
            if silence > millis(self.config.capture_timeout) {
                debug!(message = "bulk reply went silent, closing the capture", silence);
                self.dispatcher.finish_capture(&mut self.capture);
            }
            return;
        }
        if self.clock.saturating_sub(self.keep_alive) <= millis(self.config.keepalive) {
            return;
        }
        if silence > millis(self.config.link_timeout) {
            warn!(message = "device is silent, presuming the link dead", silence);
            self.close();
            return;
        }
        let ping = self.config.keepalive_command.clone();
        if self.send_command(&ping) {
            trace!(message = "keep-alive sent");
            self.keep_alive = self.clock;
        }
    }

    /// Issue at most one register request.
    pub fn push(&mut self) {
        let now = self.clock;
        if self.transport.is_none()
            || now < self.locked
            || self.dispatcher.mode() == DispatchMode::BulkCapture
        {
            return;
        }
        let abandon = millis(self.config.request_timeout);
        if self.scheduler.is_busy(&mut self.table, now, abandon) {
            return;
        }
        let refresh = millis(self.config.read_only_refresh);
        let Some(request) = self.scheduler.select(&mut self.table, now, abandon, refresh) else {
            return;
        };
        let text = request.to_string();
        let Some(transport) = &mut self.transport else { return };
        match transport.try_write_line(&text) {
            Ok(()) => {
                trace!(message = "sent", line = text);
                self.scheduler.sent(&mut self.table, &request, now);
                self.locked = now.saturating_add(millis(self.config.quantum));
            }
            Err(transport::Error::WouldBlock) => {
                trace!(message = "transport busy, request postponed", line = text);
            }
            Err(transport::Error::Closed) => {
                warn!(message = "transport closed by the other end");
                self.close();
            }
        }
    }

    /// Send pass-through command text, one line per line of `text`.
    ///
    /// Returns `false` if the session is locked out, a register request is still awaiting
    /// its reply, or the transport did not take the text.
    /// A refusal of the command by the device surfaces through [`Session::warning`].
    pub fn command(&mut self, text: &str) -> bool {
        if !self.send_command(text) {
            return false;
        }
        self.dispatcher.expect_refusal();
        true
    }

    fn send_command(&mut self, text: &str) -> bool {
        if self.clock < self.locked {
            return false;
        }
        // a register request awaiting its reply holds the line
        let abandon = millis(self.config.request_timeout);
        if self.scheduler.is_busy(&mut self.table, self.clock, abandon) {
            return false;
        }
        let Some(transport) = &mut self.transport else {
            return false;
        };
        for line in text.lines() {
            match transport.try_write_line(line) {
                Ok(()) => trace!(message = "sent", line),
                Err(e) => {
                    debug!(message = "command not sent", line, error = (&e as &dyn std::error::Error));
                    if e == transport::Error::Closed {
                        self.close();
                    }
                    return false;
                }
            }
        }
        self.locked = self.clock.saturating_add(millis(self.config.quantum));
        true
    }

    /// Ask the device to list its registers.
    pub fn announce(&mut self) -> bool {
        let command = self.config.announce_command.clone();
        self.send_command(&command)
    }

    pub fn registers(&self) -> &RegisterTable {
        &self.table
    }

    pub fn registers_mut(&mut self) -> &mut RegisterTable {
        &mut self.table
    }

    pub fn lookup(&self, symbol: &str) -> Option<&Register> {
        self.table.lookup(symbol)
    }

    pub fn lookup_range(&self, prefix: &str) -> Option<(usize, usize)> {
        self.table.lookup_range(prefix)
    }

    /// Stage a new value for `symbol`; the scheduler commits it. Read-only and unknown
    /// registers are refused.
    pub fn edit(&mut self, symbol: &str, value: &str) -> bool {
        let now = self.clock;
        match self.table.lookup_mut(symbol) {
            Some(register) if register.mode.is_writable() => {
                register.edit(value, now);
                true
            }
            _ => false,
        }
    }

    /// Make the display of `symbol` fresh: it is fetched once more.
    pub fn show(&mut self, symbol: &str) -> bool {
        let now = self.clock;
        let Some(register) = self.table.lookup_mut(symbol) else {
            return false;
        };
        register.shown = now;
        register.one_shot = true;
        true
    }

    pub fn mark_all_shown(&mut self) {
        self.table.mark_all_shown(self.clock);
    }

    pub fn reset_ranges(&mut self) {
        self.table.reset_ranges();
    }

    pub fn mode(&self) -> DispatchMode {
        self.dispatcher.mode()
    }

    pub fn origin(&self) -> Option<Origin> {
        self.dispatcher.origin()
    }

    pub fn hardware_info(&self) -> &HwInfo {
        self.dispatcher.hw_info()
    }

    pub fn survey(&self) -> &[SurveyNode] {
        self.dispatcher.survey()
    }

    pub fn flash_map(&self) -> &[Vec<FlashBlock>] {
        self.dispatcher.flash_map()
    }

    pub fn warning(&self) -> Option<&str> {
        self.dispatcher.warning()
    }

    pub fn take_warning(&mut self) -> Option<String> {
        self.dispatcher.take_warning()
    }

    /// Returns `true` once after the device was seen restarting.
    pub fn take_uptime_warning(&mut self) -> bool {
        self.dispatcher.take_uptime_warning()
    }

    /// Direct the next bulk reply into `path` (created or truncated right away).
    pub fn open_capture(&mut self, path: &Path) -> bool {
        match self.try_open_capture(path) {
            Ok(()) => true,
            Err(e) => {
                warn!(message = "capture not opened", error = (&e as &dyn std::error::Error));
                false
            }
        }
    }

    /// [`Session::open_capture`], reporting why the file could not be created.
    pub fn try_open_capture(&mut self, path: &Path) -> Result<(), capture::Error> {
        self.capture.open(path)
    }

    pub fn close_capture(&mut self) {
        self.dispatcher.finish_capture(&mut self.capture);
        self.capture.close();
    }

    pub fn is_capturing(&self) -> bool {
        self.dispatcher.mode() == DispatchMode::BulkCapture
    }

    /// Lines received by the current or most recent bulk capture.
    pub fn capture_lines(&self) -> usize {
        self.capture.lines()
    }

    /// Write the configuration registers to `path`, one `<symbol> <value>` per line.
    ///
    /// Linked registers are written by the label of their target, which stays valid across
    /// firmware builds where ids and raw values do not.
    pub fn export_to(&self, path: &Path) -> Result<usize, Error> {
        let mut text = String::new();
        let mut count = 0;
        for (_, register) in self.table.iter() {
            if !register.mode.contains(Mode::CONFIG) {
                continue;
            }
            let value = if register.mode.contains(Mode::LINKED) {
                &register.unit
            } else {
                &register.raw_value
            };
            text.push_str(&register.symbol);
            text.push(' ');
            text.push_str(&quote_value(value));
            text.push('\n');
            count += 1;
        }
        std::fs::write(path, text).map_err(|e| Error::Export(e, path.to_path_buf()))?;
        info!(message = "registers exported", count, path = %path.display());
        Ok(count)
    }

    /// Stage the values listed in `path` as local edits. Returns the number of registers
    /// staged; unknown and read-only registers are skipped.
    pub fn import_from(&mut self, path: &Path) -> Result<usize, Error> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::Import(e, path.to_path_buf()))?;
        let mut count = 0;
        for line in text.lines() {
            let mut cursor = Cursor::new(line);
            let Some(symbol) = cursor.next_token() else { continue };
            if symbol.starts_with('#') {
                continue;
            }
            let value = cursor.next_text().unwrap_or_default();
            if self.edit(symbol, &value) {
                count += 1;
            } else {
                debug!(message = "import entry skipped", symbol);
            }
        }
        info!(message = "registers imported", count, path = %path.display());
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Peer, channel};

    fn session() -> (Session<transport::ChannelTransport>, Peer) {
        let (transport, peer) = channel(64);
        (Session::open(transport, SessionConfig::default()), peer)
    }

    #[test]
    fn first_register_echo() {
        let (mut session, peer) = session();
        peer.send_line("1 [7] pm.const_Zp = 5 ");
        assert_eq!(session.fetch(1234), 1);
        let register = session.lookup("pm.const_Zp").unwrap();
        assert_eq!(register.int_value, 5);
        assert!(register.mode.contains(Mode::CONFIG | Mode::TYPE_INT));
        assert_eq!(register.fetched, 1234);
    }

    #[test]
    fn command_respects_lock() {
        let (mut session, mut peer) = session();
        session.fetch(100);
        assert!(session.command("ap_version"));
        assert!(!session.command("ap_version"));
        session.fetch(111);
        assert!(session.command("flash_info\nap_version"));
        assert_eq!(peer.drain_sent(), ["ap_version", "flash_info", "ap_version"]);
    }

    #[test]
    fn edits_refuse_read_only_registers() {
        let (mut session, peer) = session();
        peer.send_line("2 [1] pm.lu_iD = 1.5 (A)");
        peer.send_line("1 [2] pm.i_maximal = 30 (A)");
        session.fetch(10);
        assert!(!session.edit("pm.lu_iD", "3"));
        assert!(!session.edit("pm.absent", "3"));
        assert!(session.edit("pm.i_maximal", "40"));
        assert!(session.lookup("pm.i_maximal").unwrap().is_pending_write());
    }

    #[test]
    fn blocked_request_leaves_state_untouched() {
        let (transport, mut peer) = channel(1);
        let mut session = Session::open(transport, SessionConfig::default());
        peer.send_line("1 [0] pm.a = 1");
        session.fetch(10);
        session.fetch(20);
        session.mark_all_shown();
        assert!(session.command("ap_version"));
        let locked = session.locked;
        session.fetch(40);
        session.push();
        assert_eq!(session.locked, locked);
        assert_eq!(session.lookup("pm.a").unwrap().queued, 0);
        assert_eq!(session.scheduler.in_flight(), None);
        assert_eq!(peer.drain_sent(), ["ap_version"]);
        session.push();
        assert_eq!(peer.drain_sent(), ["reg 0"]);
        assert_eq!(session.lookup("pm.a").unwrap().queued, 40);
        assert_eq!(session.locked, 50);
    }

    #[test]
    fn huge_quantum_saturates() {
        let config = SessionConfig { quantum: Duration::MAX, ..SessionConfig::default() };
        let (transport, mut peer) = channel(8);
        let mut session = Session::open(transport, config);
        session.fetch(5);
        assert!(session.command("ap_version"));
        assert_eq!(session.locked, u64::MAX);
        session.fetch(900);
        assert!(session.is_open());
        assert!(!session.command("ap_version"));
        assert_eq!(peer.drain_sent(), ["ap_version"]);
    }

    #[test]
    fn capture_open_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, _peer) = session();
        let path = dir.path().join("missing/dir/tlm.txt");
        assert!(matches!(session.try_open_capture(&path), Err(capture::Error::Create(..))));
        assert!(!session.open_capture(&path));
    }

    #[test]
    fn closed_transport_ends_the_session() {
        let (mut session, peer) = session();
        peer.send_line("1 [1] pm.a = 1");
        drop(peer);
        assert_eq!(session.fetch(10), 1);
        assert!(!session.is_open());
        assert!(session.lookup("pm.a").is_none());
        assert_eq!(session.fetch(20), 0);
    }
}
