//! Selection of the next outbound register request.
//!
//! The device processes one command at a time, so at most one request is ever in flight.
//! Registers are serviced round-robin, and a pending write always wins over a due read.
use tracing::{debug, trace};

use crate::registers::RegisterTable;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Read { id: usize },
    Write { id: usize, value: String },
}

impl Request {
    pub fn id(&self) -> usize {
        match *self {
            Request::Read { id } | Request::Write { id, .. } => id,
        }
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Read { id } => write!(f, "reg {id}"),
            Request::Write { id, value } => write!(f, "reg {id} {value}"),
        }
    }
}

/// Format a value so that it reads back as a single token.
pub(crate) fn quote_value(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\t', '"', '\\']) {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

#[derive(Default)]
pub struct Scheduler {
    last: Option<usize>,
    in_flight: Option<usize>,
}

impl Scheduler {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn in_flight(&self) -> Option<usize> {
        self.in_flight
    }

    /// Whether the request in flight is still waiting for its reply.
    ///
    /// A request without a reply for longer than `abandon_ms` is given up on; its register
    /// becomes eligible again.
    pub fn is_busy(&mut self, table: &mut RegisterTable, now: u64, abandon_ms: u64) -> bool {
        let Some(id) = self.in_flight else {
            return false;
        };
        let Some(register) = table.get_mut(id) else {
            self.in_flight = None;
            return false;
        };
        if register.queued == 0 {
            self.in_flight = None;
            return false;
        }
        if now.saturating_sub(register.queued) > abandon_ms {
            debug!(message = "request abandoned", id, symbol = register.symbol.as_str());
            register.queued = 0;
            self.in_flight = None;
            return false;
        }
        true
    }

    /// Pick the next request, starting just after the previously serviced register.
    pub fn select(
        &mut self,
        table: &mut RegisterTable,
        now: u64,
        abandon_ms: u64,
        read_only_refresh_ms: u64,
    ) -> Option<Request> {
        let n = table.max_n();
        if n == 0 {
            return None;
        }
        let start = self.last.map_or(0, |last| (last + 1) % n);
        let order = move || (0..n).map(move |k| (start + k) % n);
        for id in order() {
            let Some(register) = table.get_mut(id) else { continue };
            if register.queued != 0 && now.saturating_sub(register.queued) > abandon_ms {
                register.queued = 0;
            }
            if register.queued == 0 && register.is_pending_write() {
                return Some(Request::Write { id, value: quote_value(&register.raw_value) });
            }
        }
        for id in order() {
            let Some(register) = table.get(id) else { continue };
            if register.queued == 0 && register.is_due(read_only_refresh_ms) {
                return Some(Request::Read { id });
            }
        }
        None
    }

    /// Record that `request` went out on the wire.
    pub fn sent(&mut self, table: &mut RegisterTable, request: &Request, now: u64) {
        let id = request.id();
        if let Some(register) = table.get_mut(id) {
            register.queued = now.max(1);
        }
        trace!(message = "request in flight", id);
        self.last = Some(id);
        self.in_flight = Some(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Assignment;

    const ABANDON: u64 = 1000;
    const REFRESH: u64 = 10_000;

    fn table_with(n: usize) -> RegisterTable {
        let mut table = RegisterTable::new();
        for id in 0..n {
            let line = format!("1 [{id}] pm.r{id} = {id}");
            table.apply_assignment(&Assignment::parse(&line).unwrap(), 1);
        }
        table
    }

    fn reply(table: &mut RegisterTable, id: usize, now: u64) {
        let symbol = table.get(id).unwrap().symbol.clone();
        let line = format!("1 [{id}] {symbol} = {id}");
        table.apply_assignment(&Assignment::parse(&line).unwrap(), now);
    }

    #[test]
    fn idle_table_selects_nothing() {
        let mut table = table_with(3);
        let mut scheduler = Scheduler::default();
        assert_eq!(scheduler.select(&mut table, 5, ABANDON, REFRESH), None);
    }

    #[test]
    fn writes_preempt_reads() {
        let mut table = table_with(4);
        let mut scheduler = Scheduler::default();
        table.mark_all_shown(10);
        table.get_mut(3).unwrap().edit("42", 10);
        let request = scheduler.select(&mut table, 10, ABANDON, REFRESH).unwrap();
        assert_eq!(request, Request::Write { id: 3, value: "42".into() });
        assert_eq!(request.to_string(), "reg 3 42");
    }

    #[test]
    fn round_robin_visits_every_due_register_once() {
        let mut table = table_with(5);
        let mut scheduler = Scheduler::default();
        table.mark_all_shown(10);
        let mut now = 10;
        let mut visited = Vec::new();
        while let Some(request) = scheduler.select(&mut table, now, ABANDON, REFRESH) {
            assert!(!scheduler.is_busy(&mut table, now, ABANDON));
            scheduler.sent(&mut table, &request, now);
            assert!(scheduler.is_busy(&mut table, now, ABANDON));
            now += 1;
            reply(&mut table, request.id(), now);
            visited.push(request.id());
        }
        assert_eq!(visited, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn round_robin_resumes_after_last_serviced() {
        let mut table = table_with(5);
        let mut scheduler = Scheduler::default();
        table.get_mut(2).unwrap().edit("7", 5);
        let request = scheduler.select(&mut table, 5, ABANDON, REFRESH).unwrap();
        scheduler.sent(&mut table, &request, 5);
        reply(&mut table, 2, 6);
        table.mark_all_shown(7);
        let request = scheduler.select(&mut table, 8, ABANDON, REFRESH).unwrap();
        assert_eq!(request, Request::Read { id: 3 });
    }

    #[test]
    fn silent_requests_are_abandoned() {
        let mut table = table_with(2);
        let mut scheduler = Scheduler::default();
        table.mark_all_shown(10);
        let request = scheduler.select(&mut table, 10, ABANDON, REFRESH).unwrap();
        scheduler.sent(&mut table, &request, 10);
        assert!(scheduler.is_busy(&mut table, 500, ABANDON));
        assert!(scheduler.is_busy(&mut table, 1010, ABANDON));
        assert!(!scheduler.is_busy(&mut table, 1011, ABANDON));
        assert_eq!(table.get(request.id()).unwrap().queued, 0);
        assert_eq!(scheduler.in_flight(), None);
    }

    #[test]
    fn values_with_blanks_are_quoted() {
        assert_eq!(quote_value("1.5"), "1.5");
        assert_eq!(quote_value("a b"), "\"a b\"");
        assert_eq!(quote_value(""), "\"\"");
        assert_eq!(quote_value("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote_value(r"C:\tmp"), r#""C:\\tmp""#);
    }
}
