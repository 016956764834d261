//! JSON-lines reply output

use crate::api::Reply;
use std::io::Write;

/// Writes one reply object per line
#[derive(Debug)]
pub struct ReplyWriter<W: Write> {
    out: W,
    written: usize,
}

impl<W: Write> ReplyWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, written: 0 }
    }

    /// Write `reply` as a single line and flush it
    ///
    /// # Errors
    ///
    /// Fails only if the underlying writer does.
    pub fn write(&mut self, reply: &Reply) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.out, reply)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_writes_one_line_per_reply() {
        let mut writer = ReplyWriter::new(Vec::new());
        writer.write(&Reply::no_content()).unwrap();
        writer
            .write(&Reply {
                status: 404,
                body: json!({"code": 2000, "hint": "unknown"}),
            })
            .unwrap();
        assert_eq!(writer.written(), 2);

        let output = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines[0], json!({"status": 204, "body": null}));
        assert_eq!(lines[1]["body"]["code"], json!(2000));
    }
}
