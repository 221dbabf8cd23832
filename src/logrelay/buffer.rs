use crate::proto::{Level, LogEntry};

/// Entries kept in each tier while the log link is down.
pub const BUFFER_SIZE: usize = 50;

/// Offline buffer keeping the first and the most recent entries.
///
/// The primary tier holds the first entries since trouble began and is
/// never overwritten. The secondary tier holds the newest entries; when it
/// is full it is emptied and its size is added to the lost count.
#[derive(Debug)]
pub struct LogBuffer {
    size: usize,
    first: Vec<LogEntry>,
    last: Vec<LogEntry>,
    lost: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(BUFFER_SIZE)
    }
}

impl LogBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            first: Vec::with_capacity(size),
            last: Vec::with_capacity(size),
            lost: 0,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.first.len() < self.size {
            self.first.push(entry);
            return;
        }

        if self.last.len() >= self.size {
            self.lost += self.last.len();
            self.last.clear();
        }

        self.last.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_empty() && self.last.is_empty()
    }

    pub fn len(&self) -> usize {
        self.first.len() + self.last.len()
    }

    pub fn lost(&self) -> usize {
        self.lost
    }

    /// Hand entries to `send` in delivery order: the primary tier, one
    /// warning if entries were lost, then the secondary tier. Stops at the
    /// first entry `send` gives back; it and the rest stay buffered in
    /// place. Returns the number of entries sent.
    pub fn deliver<F>(&mut self, mut send: F) -> usize
    where
        F: FnMut(LogEntry) -> Result<(), LogEntry>,
    {
        let mut sent = 0;

        if !deliver_tier(&mut self.first, &mut send, &mut sent) {
            return sent;
        }

        if self.lost > 0 {
            let warning = LogEntry::new(
                Level::Warning,
                "log",
                format!("Lost {} log entries", self.lost),
            );
            if send(warning).is_err() {
                return sent;
            }
            self.lost = 0;
            sent += 1;
        }

        deliver_tier(&mut self.last, &mut send, &mut sent);
        sent
    }
}

fn deliver_tier<F>(tier: &mut Vec<LogEntry>, send: &mut F, sent: &mut usize) -> bool
where
    F: FnMut(LogEntry) -> Result<(), LogEntry>,
{
    let mut rest = std::mem::take(tier).into_iter();

    while let Some(entry) = rest.next() {
        if let Err(entry) = send(entry) {
            tier.push(entry);
            tier.extend(rest);
            return false;
        }
        *sent += 1;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: usize) -> LogEntry {
        LogEntry::new(Level::Info, "test", n.to_string())
    }

    fn msgs(entries: &[LogEntry]) -> Vec<String> {
        entries.iter().map(|e| e.msg.clone()).collect()
    }

    fn drain(buf: &mut LogBuffer) -> Vec<LogEntry> {
        let mut out = Vec::new();
        buf.deliver(|e| {
            out.push(e);
            Ok(())
        });
        out
    }

    #[test]
    fn test_under_capacity_keeps_everything() {
        let mut buf = LogBuffer::new(3);
        for n in 0..5 {
            buf.push(entry(n));
        }
        assert_eq!(buf.len(), 5);
        assert_eq!(msgs(&drain(&mut buf)), vec!["0", "1", "2", "3", "4"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_overflow_keeps_first_and_latest() {
        let mut buf = LogBuffer::new(3);
        // 3 primary, then 3 + 3 + 2 through the secondary.
        for n in 0..11 {
            buf.push(entry(n));
        }
        assert_eq!(buf.lost(), 6);

        let out = drain(&mut buf);
        assert_eq!(
            msgs(&out),
            vec!["0", "1", "2", "Lost 6 log entries", "9", "10"]
        );
        assert_eq!(out[3].level, Level::Warning);
        assert_eq!(buf.lost(), 0);
    }

    #[test]
    fn test_delivered_count_matches_lost() {
        let size = 5;
        let k = 37;
        let mut buf = LogBuffer::new(size);
        for n in 0..k {
            buf.push(entry(n));
        }
        let lost = buf.lost();
        let out = drain(&mut buf);
        // One extra entry for the warning.
        assert_eq!(out.len(), k - lost + 1);
        assert_eq!(out.last().map(|e| e.msg.as_str()), Some("36"));
    }

    #[test]
    fn test_rejected_entries_stay_in_place() {
        let mut buf = LogBuffer::new(3);
        for n in 0..11 {
            buf.push(entry(n));
        }

        // Accept two, then refuse.
        let mut accepted = Vec::new();
        let sent = buf.deliver(|e| {
            if accepted.len() < 2 {
                accepted.push(e);
                Ok(())
            } else {
                Err(e)
            }
        });
        assert_eq!(sent, 2);
        assert_eq!(msgs(&accepted), vec!["0", "1"]);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.lost(), 6);

        // The warning itself is refused: nothing is dropped.
        let mut accepted = Vec::new();
        buf.deliver(|e| {
            if e.level == Level::Warning {
                Err(e)
            } else {
                accepted.push(e);
                Ok(())
            }
        });
        assert_eq!(msgs(&accepted), vec!["2"]);
        assert_eq!(buf.lost(), 6);
        assert_eq!(buf.len(), 2);

        assert_eq!(
            msgs(&drain(&mut buf)),
            vec!["Lost 6 log entries", "9", "10"]
        );
        assert!(buf.is_empty());
    }
}
