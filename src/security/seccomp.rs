//! Seccomp BPF filter that cuts sandboxed commands off the network
//!
//! # What is Seccomp?
//!
//! Seccomp (Secure Computing) is a Linux kernel feature that restricts
//! which system calls a process can make. When a sandbox has networking
//! disabled we install a filter in each child, between fork and exec, that
//! refuses to create IPv4/IPv6 sockets. Everything else is allowed, so
//! ordinary tools keep working and simply see "permission denied" when
//! they try to connect.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  socket(AF_INET, ...)   ──► filter ──► EACCES                  │
//! │  socket(AF_INET6, ...)  ──► filter ──► EACCES                  │
//! │  socket(AF_UNIX, ...)   ──► filter ──► allowed                 │
//! │  read/write/open/...    ──► filter ──► allowed                 │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The filter is inherited across fork/exec and cannot be removed, so every
//! process the command starts is covered too.

use seccompiler::{
    BpfProgram,        // Vec<sock_filter> - the compiled bytecode
    SeccompAction,     // What to do: Allow, Errno, ...
    SeccompCmpArgLen,  // Width of the compared argument
    SeccompCmpOp,      // Comparison operator
    SeccompCondition,  // One argument check
    SeccompFilter,     // The filter with rules
    SeccompRule,       // A set of conditions for a syscall
    TargetArch,        // CPU architecture (x86_64, aarch64)
};
use std::collections::BTreeMap;
use std::convert::TryInto;
use std::io;

fn backend_error(e: seccompiler::BackendError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

// ═══════════════════════════════════════════════════════════════════════════
// NetworkSeccomp
// ═══════════════════════════════════════════════════════════════════════════
// WHAT IT IS:
//   A builder for a deny-list filter: the listed address families are
//   refused at socket(2), every other syscall passes.
//
// USAGE:
//   Build once in the parent (allocates), apply in the child via pre_exec
//   (apply_filter itself does not allocate).
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct NetworkSeccomp {
    /// Address families whose sockets are refused
    denied_families: Vec<i32>,
    /// errno returned to the caller
    errno: u32,
}

impl NetworkSeccomp {
    /// Deny IPv4 and IPv6 sockets with EACCES
    pub fn deny_inet() -> Self {
        Self {
            denied_families: vec![libc::AF_INET, libc::AF_INET6],
            errno: libc::EACCES as u32,
        }
    }

    /// Also refuse an additional address family
    pub fn deny_family(&mut self, family: i32) -> &mut Self {
        if !self.denied_families.contains(&family) {
            self.denied_families.push(family);
        }
        self
    }

    pub fn denied_families(&self) -> &[i32] {
        &self.denied_families
    }

    /// Compile the filter to BPF bytecode for the current architecture
    pub fn build(&self) -> Result<BpfProgram, io::Error> {
        // One rule per family: socket(family, ...) matches if arg0 == family
        let socket_rules = self
            .denied_families
            .iter()
            .map(|&family| {
                let condition = SeccompCondition::new(
                    0,
                    SeccompCmpArgLen::Dword,
                    SeccompCmpOp::Eq,
                    family as u64,
                )
                .map_err(backend_error)?;
                SeccompRule::new(vec![condition]).map_err(backend_error)
            })
            .collect::<Result<Vec<_>, io::Error>>()?;

        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
        rules.insert(libc::SYS_socket, socket_rules);

        let arch: TargetArch = std::env::consts::ARCH
            .try_into()
            .map_err(backend_error)?;

        // - mismatch_action: Allow (anything not matched passes)
        // - match_action: Errno (matched socket() calls fail)
        let filter = SeccompFilter::new(
            rules,
            SeccompAction::Allow,
            SeccompAction::Errno(self.errno),
            arch,
        )
        .map_err(backend_error)?;

        filter.try_into().map_err(backend_error)
    }

    /// Install a compiled filter on the calling thread.
    ///
    /// Meant for the forked child right before exec. IRREVERSIBLE.
    pub fn apply(program: &BpfProgram) -> Result<(), io::Error> {
        seccompiler::apply_filter(program)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

impl Default for NetworkSeccomp {
    fn default() -> Self {
        Self::deny_inet()
    }
}
