mod args;
mod inspect;
mod run;

pub use args::CliOpts;
