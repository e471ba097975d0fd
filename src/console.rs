// src/console.rs
use std::io::{self, BufRead, Write};

use log::debug;
use thiserror::Error;

use crate::device::{Device, Operation};
use crate::port::Link;
use crate::proto::reply::Reply;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("unknown operation: {0}")]
    UnknownOp(String),
    #[error("missing argument: {0}")]
    MissingArg(&'static str),
    #[error("invalid number for {0}: {1}")]
    BadNumber(&'static str, String),
    #[error("unexpected argument: {0}")]
    Extra(String),
}

/// Parse one console line, `<operation> [argument]`, into an operation.
pub fn parse_operation(line: &str) -> Result<Operation, ParseError> {
    let mut tokens = line.split_whitespace();
    let name = tokens.next().ok_or(ParseError::Empty)?;

    let op = match name.to_ascii_lowercase().as_str() {
        "get-callsign" => Operation::GetCallsign,
        "get-locator" => Operation::GetLocator,
        "get-freq" => Operation::GetFreq,
        "set-freq" => Operation::SetFreq(req_f64(tokens.next(), "freq")?),
        "set-band" => Operation::SetBand(req_u16(tokens.next(), "band")?),
        "set-tx" => Operation::SetTx,
        "set-idle" => Operation::SetIdle,
        "cancel" => Operation::Cancel,
        "get-status" => Operation::GetStatus,
        "get-version" => Operation::GetVersion,
        "get-tx-time" => Operation::GetTxTime,
        _ => return Err(ParseError::UnknownOp(name.to_string())),
    };

    let rest: Vec<&str> = tokens.collect();
    if !rest.is_empty() {
        return Err(ParseError::Extra(rest.join(" ")));
    }
    Ok(op)
}

fn req_f64(tok: Option<&str>, k: &'static str) -> Result<f64, ParseError> {
    let v = tok.ok_or(ParseError::MissingArg(k))?;
    v.parse::<f64>()
        .map_err(|_| ParseError::BadNumber(k, v.to_string()))
}

fn req_u16(tok: Option<&str>, k: &'static str) -> Result<u16, ParseError> {
    // bands are written either as "20" or "20m"
    let v = tok.ok_or(ParseError::MissingArg(k))?;
    v.trim_end_matches(['m', 'M'])
        .parse::<u16>()
        .map_err(|_| ParseError::BadNumber(k, v.to_string()))
}

/// Serve operations line by line until `input` ends or `quit` is read.
///
/// Every synchronous operation prints `ok [value]` or `error <text>`.
/// `set-tx` and `set-idle` print nothing here; their outcome is delivered
/// to the device listener when the scheduled transaction runs.
pub fn run<L, R, W>(device: &Device<L>, input: R, mut output: W) -> io::Result<()>
where
    L: Link + 'static,
    R: BufRead,
    W: Write,
{
    for line in input.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if matches!(line, "quit" | "exit") {
            break;
        }

        let reply = match parse_operation(line) {
            Ok(op) => device.dispatch(op),
            Err(e) => {
                debug!("rejected {:?}: {}", line, e);
                Some(Reply::err(e.to_string()))
            }
        };
        if let Some(reply) = reply {
            writeln!(output, "{}", reply)?;
            output.flush()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::frame::encode;
    use crate::port::testing::MockDevice;
    use crate::proto::command::{Command, MessageType};
    use crate::proto::reply::fixed_ascii;
    use crate::scheduler::testing::SimClock;

    #[test]
    fn parses_every_operation() {
        let cases = [
            ("get-callsign", Operation::GetCallsign),
            ("get-locator", Operation::GetLocator),
            ("get-freq", Operation::GetFreq),
            ("set-freq 14.097066", Operation::SetFreq(14.097066)),
            ("set-band 20", Operation::SetBand(20)),
            ("set-band 40m", Operation::SetBand(40)),
            ("SET-TX", Operation::SetTx),
            ("set-idle", Operation::SetIdle),
            ("cancel", Operation::Cancel),
            ("  get-status  ", Operation::GetStatus),
            ("get-version", Operation::GetVersion),
            ("get-tx-time", Operation::GetTxTime),
        ];
        for (line, op) in cases {
            assert_eq!(parse_operation(line), Ok(op), "{}", line);
        }
    }

    #[test]
    fn parse_errors() {
        assert_eq!(parse_operation(""), Err(ParseError::Empty));
        assert_eq!(
            parse_operation("set-power 5"),
            Err(ParseError::UnknownOp("set-power".into()))
        );
        assert_eq!(parse_operation("set-freq"), Err(ParseError::MissingArg("freq")));
        assert_eq!(
            parse_operation("set-band twenty"),
            Err(ParseError::BadNumber("band", "twenty".into()))
        );
        assert_eq!(
            parse_operation("get-freq now"),
            Err(ParseError::Extra("now".into()))
        );
    }

    #[test]
    fn session_prints_one_line_per_sync_operation() {
        let mock = MockDevice::new();
        mock.push_reply(encode(&Command::new(
            MessageType::ResponseData,
            None,
            fixed_ascii("G3UKB", 15),
        )));
        mock.push_reply(encode(&Command::new(
            MessageType::ResponseData,
            None,
            7_040_100u64.to_le_bytes().to_vec(),
        )));
        let device = Device::new(mock, Arc::new(SimClock::at(12, 0, 30, 0)), Arc::new(|_, _| {}));

        let input = "# comment\nget-callsign\n\nget-freq\nbogus\nget-status\nquit\nget-locator\n";
        let mut out = Vec::new();
        run(&device, input.as_bytes(), &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "ok G3UKB",
                "ok 7040100",
                "error unknown operation: bogus",
                "ok IDLE",
            ]
        );
    }
}
