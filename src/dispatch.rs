//! Classification and routing of inbound lines.
//!
//! The device answers every command with a burst of lines and then prints its prompt, a
//! banner such as `(pmc) ` or `(net/2) `, followed by the echo of the next command typed.
//! The dispatcher follows these bursts with a small state machine: the echo of a known
//! command selects how the lines up to the next banner are interpreted.
use std::path::PathBuf;

use tracing::{debug, info, trace, warn};

use crate::capture::Capture;
use crate::lexer::{Cursor, tokens};
use crate::number::parse_int;
use crate::registers::{Assignment, RegisterTable};

/// Keeps the survey list from growing without bound on a misbehaving network.
pub const SURVEY_MAX: usize = 32;
pub const FLASH_ROWS_MAX: usize = 16;
pub const FLASH_COLUMNS_MAX: usize = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum DispatchMode {
    #[default]
    Idle,
    AwaitingHwInfo,
    AwaitingClock,
    BulkCapture,
    AwaitingSurveyMap,
    AwaitingFlashMap,
    AwaitingWarning,
}

/// Where the prompt came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Local,
    /// A session tunnelled through the local device to a node `hops` away.
    Remote { hops: i32 },
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Local => f.write_str("pmc"),
            Origin::Remote { hops } => write!(f, "net/{hops}"),
        }
    }
}

/// Split a prompt off the front of `line`, returning the origin and whatever follows it.
pub fn parse_banner(line: &str) -> Option<(Origin, &str)> {
    if let Some(rest) = line.strip_prefix("(pmc)") {
        return Some((Origin::Local, rest.trim_start()));
    }
    let rest = line.strip_prefix("(net/")?;
    let hops = parse_int(rest)?;
    let (_, rest) = rest.split_once(')')?;
    Some((Origin::Remote { hops }, rest.trim_start()))
}

const COMMAND_MODES: &[(&str, DispatchMode)] = &[
    ("ap_version", DispatchMode::AwaitingHwInfo),
    ("ap_clock", DispatchMode::AwaitingClock),
    ("ap_time", DispatchMode::AwaitingClock),
    ("rtos_version", DispatchMode::AwaitingClock),
    ("tlm_flush_sync", DispatchMode::BulkCapture),
    ("tlm_live_sync", DispatchMode::BulkCapture),
    ("log_flush", DispatchMode::BulkCapture),
    ("export_reg", DispatchMode::BulkCapture),
    ("net_survey", DispatchMode::AwaitingSurveyMap),
    ("flash_info", DispatchMode::AwaitingFlashMap),
    ("flash_prog", DispatchMode::AwaitingWarning),
    ("flash_wipe", DispatchMode::AwaitingWarning),
    ("net_assign", DispatchMode::AwaitingWarning),
    ("net_revoke", DispatchMode::AwaitingWarning),
    ("pm_probe", DispatchMode::AwaitingWarning),
    ("pm_adjust", DispatchMode::AwaitingWarning),
];

/// The mode a command echo switches the dispatcher into, if it is a known command.
pub fn command_mode(echo: &str, keepalive_command: &str) -> Option<DispatchMode> {
    let command = Cursor::new(echo).next_token()?;
    if command == keepalive_command {
        return Some(DispatchMode::AwaitingClock);
    }
    COMMAND_MODES
        .iter()
        .find(|(prefix, _)| command.starts_with(prefix))
        .map(|(_, mode)| *mode)
}

/// Fields of the hardware information reply.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct HwInfo {
    pub hardware: Option<String>,
    pub revision: Option<String>,
    pub build: Option<String>,
    pub crc32: Option<String>,
}

impl HwInfo {
    fn absorb(&mut self, line: &str) -> bool {
        let mut cursor = Cursor::new(line);
        let field = match cursor.next_token() {
            Some("Hardware") => &mut self.hardware,
            Some("Revision") => &mut self.revision,
            Some("Build") => &mut self.build,
            Some("CRC32") => &mut self.crc32,
            _ => return false,
        };
        let value = cursor.rest().trim_end();
        let value = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')).unwrap_or(value);
        *field = Some(value.to_string());
        true
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl std::fmt::Display for HwInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fields = [
            ("Hardware", &self.hardware),
            ("Revision", &self.revision),
            ("Build", &self.build),
            ("CRC32", &self.crc32),
        ];
        let mut first = true;
        for (name, value) in fields {
            let Some(value) = value else { continue };
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{name} {value}")?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum FlashBlock {
    /// `x`: holds data.
    Used,
    /// `a`: the block currently in use.
    Active,
    /// `.`: erased.
    Empty,
}

impl FlashBlock {
    fn from_symbol(symbol: char) -> Option<Self> {
        match symbol {
            'x' => Some(Self::Used),
            'a' => Some(Self::Active),
            '.' => Some(Self::Empty),
            _ => None,
        }
    }
}

fn scan_flash_row(line: &str) -> Vec<FlashBlock> {
    let is_block_token = |t: &&str| !t.is_empty() && t.chars().all(|c| FlashBlock::from_symbol(c).is_some());
    tokens(line)
        .filter(is_block_token)
        .flat_map(|t| t.chars().filter_map(FlashBlock::from_symbol))
        .take(FLASH_COLUMNS_MAX)
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct SurveyNode {
    pub uid: u32,
    pub node_id: i32,
}

fn parse_survey(line: &str) -> Option<SurveyNode> {
    let mut uid = None;
    let mut node_id = None;
    let mut all = tokens(line);
    while let Some(token) = all.next() {
        match token {
            "UID" => uid = all.next().and_then(|t| u32::from_str_radix(t.trim_start_matches("0x"), 16).ok()),
            "NODE_ID" => node_id = all.next().and_then(parse_int),
            _ => {}
        }
    }
    Some(SurveyNode { uid: uid?, node_id: node_id? })
}

fn parse_clock(line: &str) -> Option<i32> {
    let mut cursor = Cursor::new(line);
    if cursor.next_token()? != "Clock" {
        return None;
    }
    parse_int(cursor.next_token()?)
}

/// Whether a `Unable ...` refusal is to be taken as the answer to our command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Refusal {
    #[default]
    Disarmed,
    /// The command has been sent but its prompt line has not come back yet.
    Sent,
    Armed,
}

/// What the session must do after a line has been dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Consumed,
    /// The prompt changed origin and the register table was discarded.
    RemoteHop(Origin),
}

pub struct Dispatcher {
    mode: DispatchMode,
    keepalive_command: String,
    capture_path: PathBuf,
    origin: Option<Origin>,
    hw_info: HwInfo,
    flash_map: Vec<Vec<FlashBlock>>,
    survey: Vec<SurveyNode>,
    last_clock: Option<i32>,
    uptime_warning: bool,
    warning: Option<String>,
    refusal: Refusal,
}

impl Dispatcher {
    pub fn new(keepalive_command: String, capture_path: PathBuf) -> Self {
        Self {
            mode: DispatchMode::Idle,
            keepalive_command,
            capture_path,
            origin: None,
            hw_info: HwInfo::default(),
            flash_map: Vec::new(),
            survey: Vec::new(),
            last_clock: None,
            uptime_warning: false,
            warning: None,
            refusal: Refusal::Disarmed,
        }
    }

    /// Forget everything learned from the device, except for its origin.
    pub fn reset(&mut self) {
        self.mode = DispatchMode::Idle;
        self.hw_info = HwInfo::default();
        self.flash_map.clear();
        self.survey.clear();
        self.last_clock = None;
        self.uptime_warning = false;
        self.warning = None;
        self.refusal = Refusal::Disarmed;
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn origin(&self) -> Option<Origin> {
        self.origin
    }

    pub fn hw_info(&self) -> &HwInfo {
        &self.hw_info
    }

    pub fn flash_map(&self) -> &[Vec<FlashBlock>] {
        &self.flash_map
    }

    pub fn survey(&self) -> &[SurveyNode] {
        &self.survey
    }

    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    pub fn take_warning(&mut self) -> Option<String> {
        self.warning.take()
    }

    pub fn take_uptime_warning(&mut self) -> bool {
        std::mem::take(&mut self.uptime_warning)
    }

    /// Take the next `Unable ...` line as the refusal of a command we are about to send.
    pub fn expect_refusal(&mut self) {
        self.refusal = Refusal::Sent;
    }

    /// Leave the bulk capture, as if its closing banner had arrived.
    pub fn finish_capture(&mut self, capture: &mut Capture) {
        if self.mode == DispatchMode::BulkCapture {
            capture.close();
            self.enter(DispatchMode::Idle);
        }
    }

    fn enter(&mut self, mode: DispatchMode) {
        if self.mode != mode {
            debug!(message = "dispatch mode change", from = %self.mode, to = %mode);
        }
        self.mode = mode;
    }

    pub fn dispatch(
        &mut self,
        line: &str,
        table: &mut RegisterTable,
        capture: &mut Capture,
        now: u64,
    ) -> Step {
        if let Some((origin, echo)) = parse_banner(line) {
            return self.on_banner(origin, echo, table, capture, now);
        }
        if line.starts_with("Unable ") && self.refusal != Refusal::Disarmed {
            warn!(message = "device refused the command", refusal = line);
            self.warning = Some(line.to_string());
        }
        match self.mode {
            DispatchMode::Idle => {
                if !self.try_assignment(line, table, now) {
                    self.on_echo(line, capture);
                }
            }
            DispatchMode::BulkCapture => capture.append(line),
            mode => {
                if !self.try_assignment(line, table, now) {
                    self.accumulate(mode, line);
                }
            }
        }
        Step::Consumed
    }

    fn on_banner(
        &mut self,
        origin: Origin,
        echo: &str,
        table: &mut RegisterTable,
        capture: &mut Capture,
        now: u64,
    ) -> Step {
        self.finish_capture(capture);
        self.enter(DispatchMode::Idle);
        self.refusal = match self.refusal {
            Refusal::Sent => Refusal::Armed,
            _ => Refusal::Disarmed,
        };
        let mut step = Step::Consumed;
        match self.origin.replace(origin) {
            Some(previous) if previous != origin => {
                info!(message = "remote hop, discarding the register table", from = %previous, to = %origin);
                table.clear();
                let refusal = self.refusal;
                self.reset();
                self.refusal = refusal;
                step = Step::RemoteHop(origin);
            }
            None => info!(message = "device prompt seen", origin = %origin),
            _ => {}
        }
        if !echo.is_empty() {
            if !self.try_assignment(echo, table, now) {
                self.on_echo(echo, capture);
            }
        }
        step
    }

    fn on_echo(&mut self, echo: &str, capture: &mut Capture) {
        let Some(mode) = command_mode(echo, &self.keepalive_command) else {
            trace!(message = "unclassified line", line = echo);
            return;
        };
        match mode {
            DispatchMode::AwaitingFlashMap => self.flash_map.clear(),
            DispatchMode::AwaitingSurveyMap => self.survey.clear(),
            DispatchMode::AwaitingWarning => self.refusal = Refusal::Armed,
            DispatchMode::BulkCapture => {
                if !capture.is_open() {
                    if let Err(e) = capture.open(&self.capture_path) {
                        warn!(
                            message = "bulk reply will not be saved",
                            error = (&e as &dyn std::error::Error)
                        );
                    }
                }
                capture.restart_count();
            }
            _ => {}
        }
        self.enter(mode);
    }

    fn try_assignment(&mut self, line: &str, table: &mut RegisterTable, now: u64) -> bool {
        let Some(assignment) = Assignment::parse(line) else {
            return false;
        };
        trace!(message = "register echo", id = assignment.id, symbol = assignment.symbol);
        table.apply_assignment(&assignment, now);
        true
    }

    fn accumulate(&mut self, mode: DispatchMode, line: &str) {
        match mode {
            DispatchMode::AwaitingHwInfo => {
                self.hw_info.absorb(line);
            }
            DispatchMode::AwaitingClock => {
                let Some(clock) = parse_clock(line) else { return };
                if self.last_clock.is_some_and(|last| clock < last) {
                    warn!(message = "device clock went backwards, device was reset", clock);
                    self.uptime_warning = true;
                }
                self.last_clock = Some(clock);
            }
            DispatchMode::AwaitingFlashMap => {
                let row = scan_flash_row(line);
                if !row.is_empty() && self.flash_map.len() < FLASH_ROWS_MAX {
                    self.flash_map.push(row);
                }
            }
            DispatchMode::AwaitingSurveyMap => {
                let Some(node) = parse_survey(line) else { return };
                if self.survey.len() < SURVEY_MAX && !self.survey.iter().any(|n| n.uid == node.uid) {
                    self.survey.push(node);
                }
            }
            DispatchMode::AwaitingWarning | DispatchMode::Idle | DispatchMode::BulkCapture => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new("ap_clock".into(), PathBuf::from("unused-capture.txt"))
    }

    fn feed(d: &mut Dispatcher, table: &mut RegisterTable, lines: &[&str]) -> Vec<Step> {
        let mut capture = Capture::default();
        lines.iter().map(|l| d.dispatch(l, table, &mut capture, 10)).collect()
    }

    #[test]
    fn banners() {
        assert_eq!(parse_banner("(pmc) reg 7"), Some((Origin::Local, "reg 7")));
        assert_eq!(parse_banner("(pmc)"), Some((Origin::Local, "")));
        assert_eq!(parse_banner("(net/3) ap_clock"), Some((Origin::Remote { hops: 3 }, "ap_clock")));
        assert_eq!(parse_banner("(net/x)"), None);
        assert_eq!(parse_banner("pmc"), None);
    }

    #[test]
    fn command_table() {
        assert_eq!(command_mode("ap_version", "ap_clock"), Some(DispatchMode::AwaitingHwInfo));
        assert_eq!(command_mode("tlm_flush_sync 100", "ap_clock"), Some(DispatchMode::BulkCapture));
        assert_eq!(command_mode("rtos_uptime", "rtos_uptime"), Some(DispatchMode::AwaitingClock));
        assert_eq!(command_mode("pm_probe_base", "ap_clock"), Some(DispatchMode::AwaitingWarning));
        assert_eq!(command_mode("reg 7", "ap_clock"), None);
    }

    #[test]
    fn hardware_info() {
        let mut d = dispatcher();
        let mut table = RegisterTable::new();
        feed(&mut d, &mut table, &[
            "(pmc) ap_version",
            "Hardware \"PMC_REV5A\"",
            "Revision 2024.1",
            "1 [3] ap.name = board",
            "Build 2024-03-11",
            "CRC32 0x1A2B3C4D (OK)",
            "Unrelated text",
            "(pmc) ",
        ]);
        let info = d.hw_info();
        assert_eq!(info.hardware.as_deref(), Some("PMC_REV5A"));
        assert_eq!(info.revision.as_deref(), Some("2024.1"));
        assert_eq!(info.crc32.as_deref(), Some("0x1A2B3C4D (OK)"));
        assert_eq!(d.mode(), DispatchMode::Idle);
        // register echoes are honoured inside informational replies
        assert_eq!(table.lookup("ap.name").unwrap().raw_value, "board");
    }

    #[test]
    fn clock_regression_sets_uptime_warning() {
        let mut d = dispatcher();
        let mut table = RegisterTable::new();
        feed(&mut d, &mut table, &["(pmc) ap_clock", "Clock 5000", "(pmc) ap_clock", "Clock 6000"]);
        assert!(!d.take_uptime_warning());
        feed(&mut d, &mut table, &["(pmc) ap_clock", "Clock 120"]);
        assert!(d.take_uptime_warning());
        assert!(!d.take_uptime_warning());
    }

    #[test]
    fn flash_map_is_rebuilt_per_reply() {
        let mut d = dispatcher();
        let mut table = RegisterTable::new();
        feed(&mut d, &mut table, &["(pmc) flash_info", "Flash map", " 0  x x a .", " 1  . . . ."]);
        assert_eq!(d.flash_map().len(), 2);
        assert_eq!(
            d.flash_map()[0],
            [FlashBlock::Used, FlashBlock::Used, FlashBlock::Active, FlashBlock::Empty]
        );
        feed(&mut d, &mut table, &["(pmc) flash_info", "xa.."]);
        assert_eq!(d.flash_map().len(), 1);
        assert_eq!(d.flash_map()[0].len(), 4);
    }

    #[test]
    fn survey_list() {
        let mut d = dispatcher();
        let mut table = RegisterTable::new();
        feed(&mut d, &mut table, &[
            "(pmc) net_survey",
            "UID 0A1B2C3D NODE_ID 2",
            "UID 0A1B2C3D NODE_ID 2",
            "UID 99887766 NODE_ID 5",
            "garbage UID zz",
        ]);
        assert_eq!(
            d.survey(),
            [SurveyNode { uid: 0x0A1B2C3D, node_id: 2 }, SurveyNode { uid: 0x99887766, node_id: 5 }]
        );
    }

    #[test]
    fn refusals_are_captured_only_when_expected() {
        let mut d = dispatcher();
        let mut table = RegisterTable::new();
        feed(&mut d, &mut table, &["(pmc) reg 7", "Unable to comply"]);
        assert_eq!(d.warning(), None);
        feed(&mut d, &mut table, &["(pmc) flash_prog", "Unable to write flash"]);
        assert_eq!(d.warning(), Some("Unable to write flash"));
        d.expect_refusal();
        feed(&mut d, &mut table, &["(pmc) hal_reset", "Unable to reset now"]);
        assert_eq!(d.take_warning().as_deref(), Some("Unable to reset now"));
        feed(&mut d, &mut table, &["(pmc) reg 7", "Unable to comply"]);
        assert_eq!(d.warning(), None);
    }

    #[test]
    fn remote_hop_discards_table() {
        let mut d = dispatcher();
        let mut table = RegisterTable::new();
        let steps = feed(&mut d, &mut table, &["(pmc) reg 1", "1 [1] pm.a = 1"]);
        assert_eq!(steps, [Step::Consumed, Step::Consumed]);
        assert!(table.lookup("pm.a").is_some());
        let steps = feed(&mut d, &mut table, &["(net/1) reg 1"]);
        assert_eq!(steps, [Step::RemoteHop(Origin::Remote { hops: 1 })]);
        assert!(table.lookup("pm.a").is_none());
        assert_eq!(d.origin(), Some(Origin::Remote { hops: 1 }));
    }

    #[test]
    fn bulk_capture_suppresses_register_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.txt");
        let mut d = Dispatcher::new("ap_clock".into(), path.clone());
        let mut table = RegisterTable::new();
        let mut capture = Capture::default();
        for line in ["(pmc) export_reg", "1 [1] pm.a = 1", "free text", "(pmc) "] {
            d.dispatch(line, &mut table, &mut capture, 1);
        }
        assert!(table.lookup("pm.a").is_none());
        assert_eq!(capture.lines(), 2);
        assert!(!capture.is_open());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1 [1] pm.a = 1\nfree text\n");
    }
}
