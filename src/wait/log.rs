//! Log-pattern readiness.
//!
//! Each poll decodes only the bytes beyond what earlier polls consumed and
//! appends them to the decoded log. Occurrences are then counted over the
//! whole decoded log, so a pattern spanning lines (a substring containing
//! `\n`, or a `(?s)` regex) is found no matter how the output was split
//! across polls.
//!
//! Multiplexed streams are decoded frame by frame. A header with an unknown
//! stream byte or non-zero padding, or a stream that shrinks below the cursor,
//! fails with [`TestbedError::LogStreamOutOfSync`] instead of mis-counting.

use async_trait::async_trait;
use regex::Regex;
use std::fmt;
use std::time::Duration;

use super::poll::{poll_until_ready, PollSettings, Probe, Prober};
use super::{StrategyTarget, WaitContext};
use crate::constants::{log_frame, wait as defaults};
use crate::error::{Result, TestbedError};
use crate::runtime::{LogFraming, LogStream};

#[derive(Debug, Clone)]
pub enum LogPattern {
    Substring(String),
    Regex(Regex),
}

impl LogPattern {
    fn count_in(&self, text: &str) -> usize {
        match self {
            LogPattern::Substring(needle) if needle.is_empty() => 0,
            LogPattern::Substring(needle) => text.matches(needle.as_str()).count(),
            LogPattern::Regex(regex) => regex.find_iter(text).count(),
        }
    }
}

impl fmt::Display for LogPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogPattern::Substring(needle) => write!(f, "{needle:?}"),
            LogPattern::Regex(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogStrategy {
    pattern: LogPattern,
    occurrence: usize,
    poll_interval: Option<Duration>,
    startup_timeout: Option<Duration>,
}

impl LogStrategy {
    pub fn new(substring: impl Into<String>) -> Self {
        Self::with_pattern(LogPattern::Substring(substring.into()))
    }

    /// A regex pattern. A malformed pattern is a configuration error.
    pub fn regex(pattern: &str) -> Result<Self> {
        Ok(Self::with_pattern(LogPattern::Regex(Regex::new(pattern)?)))
    }

    fn with_pattern(pattern: LogPattern) -> Self {
        Self {
            pattern,
            occurrence: defaults::DEFAULT_OCCURRENCE,
            poll_interval: None,
            startup_timeout: None,
        }
    }

    pub fn with_occurrence(mut self, occurrence: usize) -> Self {
        self.occurrence = occurrence;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    pub fn occurrence(&self) -> usize {
        self.occurrence
    }

    pub fn validate(&self) -> Result<()> {
        if self.occurrence == 0 {
            return Err(TestbedError::configuration(format!(
                "log strategy {} needs an occurrence of at least 1",
                self.pattern
            )));
        }
        if matches!(&self.pattern, LogPattern::Substring(s) if s.is_empty()) {
            return Err(TestbedError::configuration("log strategy pattern is empty"));
        }
        Ok(())
    }

    pub async fn wait_until_ready(&self, target: &dyn StrategyTarget, ctx: &WaitContext) -> Result<()> {
        let settings = PollSettings::resolve(
            self.to_string(),
            self.startup_timeout,
            self.poll_interval,
            ctx,
        );
        let mut prober = LogProber {
            strategy: self,
            cursor: LogCursor::default(),
        };
        poll_until_ready(&settings, target, &ctx.cancellation, &mut prober).await
    }
}

impl fmt::Display for LogStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "log {} x{}", self.pattern, self.occurrence)
    }
}

struct LogProber<'a> {
    strategy: &'a LogStrategy,
    cursor: LogCursor,
}

#[async_trait]
impl Prober for LogProber<'_> {
    async fn probe(&mut self, target: &dyn StrategyTarget) -> Result<Probe> {
        let stream = target.logs().await?;
        let seen = self.cursor.advance(&stream, &self.strategy.pattern)?;
        if seen >= self.strategy.occurrence {
            Ok(Probe::Ready)
        } else {
            Ok(Probe::NotReady(format!(
                "pattern seen {seen} of {} times",
                self.strategy.occurrence
            )))
        }
    }
}

/// Incremental decoder and match counter over an accumulating log stream
#[derive(Debug, Default)]
pub(crate) struct LogCursor {
    /// Bytes of the raw stream already consumed
    consumed: usize,
    header: Vec<u8>,
    /// Payload bytes left in the current multiplexed frame
    frame_remaining: usize,
    /// Everything decoded so far
    decoded: Vec<u8>,
}

impl LogCursor {
    /// Consume the new part of `stream` and return the total occurrence count.
    pub(crate) fn advance(&mut self, stream: &LogStream, pattern: &LogPattern) -> Result<usize> {
        if stream.bytes.len() < self.consumed {
            return Err(TestbedError::LogStreamOutOfSync {
                offset: stream.bytes.len(),
            });
        }

        let fresh = &stream.bytes[self.consumed..];
        match stream.framing {
            LogFraming::Raw => self.decoded.extend_from_slice(fresh),
            LogFraming::Multiplexed => self.decode_frames(fresh)?,
        }
        self.consumed = stream.bytes.len();

        Ok(pattern.count_in(&String::from_utf8_lossy(&self.decoded)))
    }

    fn decode_frames(&mut self, mut fresh: &[u8]) -> Result<()> {
        let mut offset = self.consumed;
        while !fresh.is_empty() {
            if self.frame_remaining == 0 {
                let wanted = log_frame::HEADER_LEN - self.header.len();
                let take = wanted.min(fresh.len());
                self.header.extend_from_slice(&fresh[..take]);
                fresh = &fresh[take..];
                offset += take;

                if self.header.len() < log_frame::HEADER_LEN {
                    break;
                }

                let header_start = offset - log_frame::HEADER_LEN;
                let stream_type = self.header[0];
                let valid_stream = matches!(
                    stream_type,
                    log_frame::STREAM_STDIN | log_frame::STREAM_STDOUT | log_frame::STREAM_STDERR
                );
                if !valid_stream || self.header[1..4] != [0, 0, 0] {
                    return Err(TestbedError::LogStreamOutOfSync {
                        offset: header_start,
                    });
                }

                let size = u32::from_be_bytes([
                    self.header[4],
                    self.header[5],
                    self.header[6],
                    self.header[7],
                ]);
                self.frame_remaining = size as usize;
                self.header.clear();
            } else {
                let take = self.frame_remaining.min(fresh.len());
                self.decoded.extend_from_slice(&fresh[..take]);
                fresh = &fresh[take..];
                offset += take;
                self.frame_remaining -= take;
            }
        }
        Ok(())
    }
}
