use std::io::Write;

use anyhow::Result;

use crate::trace::AccessEvent;

/// Where classified access events go.
///
/// The supervisor hands every event to the sink as soon as it is classified;
/// sinks flush per event so that output keeps pace with the tracee.
pub trait EventSink {
    fn emit(&mut self, event: &AccessEvent) -> Result<()>;
}

/// The human-readable line format:
///
/// ```text
/// <SYMBOL>   read    VALUE
/// <SYMBOL>   write   BEFORE -> AFTER
/// ```
pub struct PlainSink<W: Write> {
    out: W,
}

impl<W: Write> PlainSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> EventSink for PlainSink<W> {
    fn emit(&mut self, event: &AccessEvent) -> Result<()> {
        match event {
            AccessEvent::Read { symbol, value } => {
                writeln!(self.out, "<{}>   read    {}", symbol, value)?;
            }
            AccessEvent::Write {
                symbol,
                before,
                after,
            } => {
                writeln!(self.out, "<{}>   write   {} -> {}", symbol, before, after)?;
            }
        }
        self.out.flush()?;

        Ok(())
    }
}

/// One JSON object per event, one event per line.
pub struct JsonSink<W: Write> {
    out: W,
}

impl<W: Write> JsonSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> EventSink for JsonSink<W> {
    fn emit(&mut self, event: &AccessEvent) -> Result<()> {
        serde_json::to_writer(&mut self.out, event)?;
        writeln!(self.out)?;
        self.out.flush()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::WatchValue;

    fn events() -> Vec<AccessEvent> {
        vec![
            AccessEvent::Write {
                symbol: "xd4".to_string(),
                before: WatchValue::DWord(0),
                after: WatchValue::DWord(7),
            },
            AccessEvent::Read {
                symbol: "xd4".to_string(),
                value: WatchValue::DWord(7),
            },
        ]
    }

    #[test]
    fn test_plain_format() {
        let mut out = Vec::new();
        {
            let mut sink = PlainSink::new(&mut out);
            for event in events() {
                sink.emit(&event).unwrap();
            }
        }

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "<xd4>   write   0 -> 7\n<xd4>   read    7\n"
        );
    }

    #[test]
    fn test_plain_format_is_signed() {
        let mut out = Vec::new();
        {
            let mut sink = PlainSink::new(&mut out);
            sink.emit(&AccessEvent::Write {
                symbol: "counter".to_string(),
                before: WatchValue::QWord(-1),
                after: WatchValue::QWord(-2),
            })
            .unwrap();
        }

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "<counter>   write   -1 -> -2\n"
        );
    }

    #[test]
    fn test_json_format() {
        let mut out = Vec::new();
        {
            let mut sink = JsonSink::new(&mut out);
            for event in events() {
                sink.emit(&event).unwrap();
            }
        }

        let lines: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["access"], "write");
        assert_eq!(lines[0]["symbol"], "xd4");
        assert_eq!(lines[0]["before"], 0);
        assert_eq!(lines[0]["after"], 7);
        assert_eq!(lines[1]["access"], "read");
        assert_eq!(lines[1]["value"], 7);
    }
}
