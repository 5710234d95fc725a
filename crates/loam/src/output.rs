//! Output modes for the `loam` CLI
//!
//! With `--json` every result is one versioned envelope holding either
//! `data` or `error`. Otherwise results print as text, and `--quiet` keeps
//! only errors.

use loam::Error;
use serde::Serialize;

use crate::cli::Cli;

const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct Envelope<T> {
    version: u32,
    ok: bool,
    #[serde(flatten)]
    body: Body<T>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum Body<T> {
    Data(T),
    Error(Failure),
}

#[derive(Debug, Serialize)]
struct Failure {
    code: String,
    message: String,
    fatal: bool,
}

impl From<&Error> for Failure {
    fn from(err: &Error) -> Self {
        Self {
            code: err.error_code().to_string(),
            message: err.to_string(),
            fatal: err.is_fatal(),
        }
    }
}

fn render<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| {
        format!(
            "{{\"version\":{},\"ok\":false,\"error\":{{\"code\":\"internal\",\"message\":{:?}}}}}",
            ENVELOPE_VERSION,
            e.to_string()
        )
    })
}

fn envelope<T: Serialize>(body: Body<T>) -> String {
    let ok = matches!(body, Body::Data(_));
    render(&Envelope {
        version: ENVELOPE_VERSION,
        ok,
        body,
    })
}

/// Where command results go, per the global flags
#[derive(Debug, Clone, Copy)]
pub struct Printer {
    json: bool,
    quiet: bool,
}

impl Printer {
    pub fn new(cli: &Cli) -> Self {
        Self {
            json: cli.json,
            quiet: cli.quiet,
        }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    /// A command's result: the envelope in JSON mode, pretty JSON otherwise
    pub fn result<T: Serialize>(&self, data: T) {
        if self.json {
            println!("{}", envelope(Body::Data(data)));
        } else if !self.quiet {
            println!("{}", render(&data));
        }
    }

    /// One line of text output; dropped in JSON and quiet modes
    pub fn line(&self, msg: impl AsRef<str>) {
        if !self.json && !self.quiet {
            println!("{}", msg.as_ref());
        }
    }

    pub fn error(&self, err: &Error) {
        if self.json {
            eprintln!("{}", envelope::<()>(Body::Error(Failure::from(err))));
        } else {
            eprintln!("error: {}", err);
        }
    }
}
