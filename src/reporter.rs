use crate::error::Error;

/// Receives errors that have no caller left to return them to.
pub trait Reporter: Send + Sync {
    fn report(&self, err: &Error);
}

/// Reports errors to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, err: &Error) {
        error!("{}", err);
    }
}
