//! Runtime bookkeeping for an acquisition run: how many macropulses we saw, per
//! channel and in total, how often the DAQ had nothing for us, and what (if
//! anything) stopped the run early. Every run ends in a [`RunSummary`], failed or not.

use std::fmt;

/// Events seen per channel, in the order channels first showed up
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelTally {
    entries: Vec<(String, u64)>,
}

impl ChannelTally {
    /// Count one more event for `channel`, returning its running total
    pub fn record(&mut self, channel: &str) -> u64 {
        match self.entries.iter_mut().find(|(name, _)| name == channel) {
            Some((_, events)) => {
                *events += 1;
                *events
            }
            None => {
                self.entries.push((channel.to_owned(), 1));
                1
            }
        }
    }

    pub fn get(&self, channel: &str) -> Option<u64> {
        self.entries
            .iter()
            .find(|(name, _)| name == channel)
            .map(|(_, events)| *events)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(name, events)| (name.as_str(), *events))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    /// Poll results that carried at least one fresh batch
    pub total_events: u64,
    pub empty_polls: u64,
    /// Batches dropped because their pulse id was not newer than the last one
    pub stale_batches: u64,
    pub tally: ChannelTally,
    pub cancelled: bool,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Summary:")?;
        writeln!(
            f,
            "Total events: {} emptycount {}",
            self.total_events, self.empty_polls
        )?;
        if self.stale_batches > 0 {
            writeln!(f, "Stale batches skipped: {}", self.stale_batches)?;
        }
        for (channel, events) in self.tally.iter() {
            writeln!(f, "{channel}:\t{events} events")?;
        }
        if self.cancelled {
            writeln!(f, "Interrupted before the end of the window")?;
        }
        if let Some(e) = &self.error {
            writeln!(f, "Something went wrong, stopped early: {e}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_first_sight_is_one() {
        let mut tally = ChannelTally::default();
        assert_eq!(tally.record("HN/CH_1.00"), 1);
        assert_eq!(tally.record("NR/CH_1.00"), 1);
        assert_eq!(tally.record("HN/CH_1.00"), 2);
        assert_eq!(tally.get("HN/CH_1.00"), Some(2));
        assert_eq!(tally.get("NL/CH_1.00"), None);
        let order: Vec<_> = tally.iter().map(|(c, _)| c).collect();
        assert_eq!(order, vec!["HN/CH_1.00", "NR/CH_1.00"]);
    }

    #[test]
    fn test_summary_text() {
        let mut summary = RunSummary {
            total_events: 3,
            empty_polls: 7,
            ..Default::default()
        };
        summary.tally.record("NR/CH_1.00");
        summary.error = Some("link down".into());
        let text = summary.to_string();
        assert!(text.contains("Total events: 3 emptycount 7"));
        assert!(text.contains("NR/CH_1.00:\t1 events"));
        assert!(text.contains("link down"));
        assert!(!summary.is_success());
    }
}
