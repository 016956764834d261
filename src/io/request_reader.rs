//! Streaming reader of JSON-lines requests
//!
//! Each non-empty line of the input holds one [`Request`] object. Lines
//! starting with `#` are comments. The reader yields one item per request
//! line, so a malformed line is reported and the following lines are
//! still read.
//!
//! ```no_run
//! use taler_merchant_backend::io::RequestReader;
//! use std::path::Path;
//!
//! let reader = RequestReader::open(Path::new("requests.jsonl")).unwrap();
//! for result in reader {
//!     match result {
//!         Ok(request) => println!("{}", request.name()),
//!         Err(e) => eprintln!("{}", e),
//!     }
//! }
//! ```

use crate::api::Request;
use crate::types::MerchantError;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("Failed to open '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Line {line}: read error: {source}")]
    Io {
        line: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Line {line}: invalid request: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl ReadError {
    /// Whether reading cannot continue after this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ReadError::Json { .. })
    }

    /// Error reply for a line that could not be decoded
    pub fn to_merchant_error(&self) -> MerchantError {
        MerchantError::JsonInvalid {
            message: self.to_string(),
        }
    }
}

/// Iterator over the requests of a JSON-lines source
#[derive(Debug)]
pub struct RequestReader<R> {
    lines: std::io::Lines<R>,
    line_num: usize,
    failed: bool,
}

impl RequestReader<BufReader<File>> {
    /// Open the file at `path`
    ///
    /// # Errors
    ///
    /// `ReadError::Open` if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self, ReadError> {
        let file = File::open(path).map_err(|source| ReadError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::new(BufReader::with_capacity(8 * 1024, file)))
    }
}

impl<R: BufRead> RequestReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_num: 0,
            failed: false,
        }
    }
}

impl<R: BufRead> Iterator for RequestReader<R> {
    type Item = Result<Request, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let line = self.lines.next()?;
            self.line_num += 1;
            let line = match line {
                Ok(line) => line,
                Err(source) => {
                    self.failed = true;
                    return Some(Err(ReadError::Io {
                        line: self.line_num,
                        source,
                    }));
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            return Some(serde_json::from_str(trimmed).map_err(|source| ReadError::Json {
                line: self.line_num,
                source,
            }));
        }
    }
}
