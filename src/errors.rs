//! Error taxonomy for the harness and helpers for tracking where an
//! error was raised.
//!
//! Failures that the runtime recovers from on its own (a crashed
//! task, an expired checkpoint, a stale message) never surface as a
//! [`HarnessError`] to the caller; they are handled inside the job
//! master. What is left here are the errors a caller can actually
//! act on: bad pipelines, bad configuration, store problems and
//! runtime plumbing failures.

use std::any::Any;
use std::panic::Location;

use thiserror::Error;

use crate::recovery::model::TaskId;

/// Result type used throughout the crate.
pub type HarnessResult<T> = Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// The pipeline description can't be turned into an execution
    /// graph.
    #[error("invalid pipeline: {0}")]
    Pipeline(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("checkpoint store error: {0}")]
    Store(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("sqlite migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A task terminated abnormally.
    #[error("task {task} failed: {reason}")]
    Task { task: TaskId, reason: String },
    /// The task was asked to stop because its attempt was superseded
    /// or the job ended.
    #[error("task cancelled")]
    Cancelled,
    #[error("runtime error: {0}")]
    Runtime(String),
    /// Another error with some extra context about where it passed
    /// through.
    #[error("{msg}\nCaused by => {source}")]
    Context {
        msg: String,
        #[source]
        source: Box<HarnessError>,
    },
}

/// A trait to add a location-tracked message to anything that can be
/// converted into a [`HarnessResult`].
pub(crate) trait Reraise<T> {
    /// The one method implementors provide.
    fn into_harness_result(self) -> HarnessResult<T>;

    /// Make the existing error the cause of a new error carrying
    /// this message and the caller's location.
    ///
    /// Example:
    ///     store.load_latest().reraise("error loading resume checkpoint")?;
    #[track_caller]
    fn reraise(self, msg: &str) -> HarnessResult<T>
    where
        Self: Sized,
    {
        let caller = Location::caller();
        self.into_harness_result()
            .map_err(|source| HarnessError::Context {
                msg: prepend_caller(caller, msg),
                source: Box::new(source),
            })
    }

    /// Same as [`Reraise::reraise`] but only builds the message if
    /// there was an error.
    #[track_caller]
    fn reraise_with(self, msg: impl FnOnce() -> String) -> HarnessResult<T>
    where
        Self: Sized,
    {
        let caller = Location::caller();
        self.into_harness_result()
            .map_err(|source| HarnessError::Context {
                msg: prepend_caller(caller, &msg()),
                source: Box::new(source),
            })
    }
}

impl<T, E> Reraise<T> for Result<T, E>
where
    E: Into<HarnessError>,
{
    fn into_harness_result(self) -> HarnessResult<T> {
        self.map_err(Into::into)
    }
}

/// Use this function to create an error with location tracking.
///
/// Example:
///     return Err(tracked_err(HarnessError::Pipeline, "pipeline has no input"));
#[track_caller]
pub(crate) fn tracked_err(make: fn(String) -> HarnessError, msg: &str) -> HarnessError {
    let caller = Location::caller();
    make(prepend_caller(caller, msg))
}

/// Tag a message with where it was raised.
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

/// Tag every line with the current thread's name. Task threads are
/// named after their task, so this says which task failed.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

/// Try to get a human readable message out of a caught panic.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(err) = payload.downcast_ref::<HarnessError>() {
        err.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else {
        // Give up trying to understand the error; the payload's Debug
        // representation would just be `Any { .. }`.
        "unknown panic payload".to_string()
    }
}

#[test]
fn tracked_err_includes_location() {
    let err = tracked_err(HarnessError::Pipeline, "no input");
    let msg = err.to_string();
    assert!(msg.starts_with("invalid pipeline: ("), "{msg}");
    assert!(msg.contains("errors.rs"), "{msg}");
    assert!(msg.ends_with("no input"), "{msg}");
}

#[test]
fn reraise_wraps_source() {
    let res: Result<(), std::io::Error> = Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "missing db file",
    ));
    let err = res.reraise("can't open checkpoint store").unwrap_err();
    match &err {
        HarnessError::Context { msg, source } => {
            assert!(msg.ends_with("can't open checkpoint store"));
            assert!(matches!(**source, HarnessError::Io(_)));
        }
        other => panic!("expected context error, got {other:?}"),
    }
    assert!(err.to_string().contains("Caused by => io error: missing db file"));
}

#[test]
fn prepend_tname_tags_every_line() {
    let tagged = std::thread::Builder::new()
        .name("faultline-test".to_string())
        .spawn(|| prepend_tname("one\ntwo".to_string()))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(tagged, "<faultline-test> one\n<faultline-test> two\n");
}

#[test]
fn panic_message_understands_common_payloads() {
    let res = std::panic::catch_unwind(|| panic!("boom {}", 1));
    assert_eq!(panic_message(res.unwrap_err().as_ref()), "boom 1");

    let res = std::panic::catch_unwind(|| std::panic::panic_any(7_u8));
    assert_eq!(
        panic_message(res.unwrap_err().as_ref()),
        "unknown panic payload"
    );
}
