//! Opt-in diagnostics, gated by explicit flags rather than a
//! `tracing`/`log`-framework dependency: thin `eprintln!`/`println!`
//! wrappers are all these two low-volume, independently-enabled outputs
//! need.

use std::fmt::Arguments;

/// Emits a line to stderr if `enabled`. Takes the flag explicitly rather
/// than reading [`crate::config::config`] itself, so call sites that run
/// before config is fully published (e.g. during config parsing) can still
/// log.
pub fn log(enabled: bool, args: Arguments<'_>) {
    if enabled {
        eprintln!("[alloc-sampler] {args}");
    }
}

/// Emits one line-oriented event record to standard output if `enabled`
/// (spec.md section 1: "optional line-oriented event traces on the
/// process's standard output"), distinct from both the stderr diagnostic
/// log above and the one-shot JSON summary written at exit. Gated by
/// `SAMPLER_EVENT_TRACE`, off by default; every wrapper call that reaches
/// a terminal outcome emits exactly one line here.
pub fn trace(enabled: bool, args: Arguments<'_>) {
    if enabled {
        println!("{args}");
    }
}

/// Always emitted, regardless of `SAMPLER_LOG`: used only for the fatal
/// symbol-resolution failure path (spec.md section 7), which aborts the
/// process immediately after.
pub fn fatal(args: Arguments<'_>) {
    eprintln!("[alloc-sampler] fatal: {args}");
}
