//! Capability bounding-set drops for sandboxed commands
//!
//! # Why the Bounding Set?
//!
//! A sandboxed command may be started by a privileged host process, and it
//! may try to exec setuid or file-capability binaries. The bounding set is
//! the ceiling for every capability the process (and anything it execs)
//! can ever hold:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  after execve():  Permitted' = (file caps ∩ Bounding) ∪ ...       │
//! │                                                                   │
//! │  Bounding without CAP_SYS_ADMIN                                   │
//! │     ⇒ nothing exec'd from here can regain CAP_SYS_ADMIN           │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Drops happen in the forked child right before exec, through
//! `prctl(PR_CAPBSET_DROP)`. That call neither allocates nor takes locks,
//! which makes it safe between fork and exec in a multi-threaded runtime.
//! Without CAP_SETPCAP the kernel refuses the drop; an unprivileged host
//! has nothing to drop in the first place, so that case is ignored.

use std::io;

use caps::Capability;

// ═══════════════════════════════════════════════════════════════════════════
// CapabilityDropper
// ═══════════════════════════════════════════════════════════════════════════
// WHAT IT IS:
//   The list of capabilities a sandboxed command must never hold.
//
// USAGE:
//   Build in the parent, call apply_bounding() inside pre_exec.
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct CapabilityDropper {
    caps_to_drop: Vec<Capability>,
}

impl CapabilityDropper {
    pub fn new() -> Self {
        Self::default()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // with_sandbox_drops() - everything untrusted code has no business with
    // ═══════════════════════════════════════════════════════════════════════
    // ```text
    // ┌────────────────────┬──────────────────────────────────────────────┐
    // │ Capability         │ Risk                                         │
    // ├────────────────────┼──────────────────────────────────────────────┤
    // │ CAP_SYS_ADMIN      │ mount, namespaces, most of the kernel        │
    // │ CAP_SYS_PTRACE     │ attach to host processes                     │
    // │ CAP_SYS_MODULE     │ load kernel modules                          │
    // │ CAP_NET_ADMIN      │ reconfigure host networking                  │
    // │ CAP_NET_RAW        │ raw sockets                                  │
    // │ CAP_SETUID/SETGID  │ become any user                              │
    // │ CAP_DAC_*          │ ignore file permissions                      │
    // └────────────────────┴──────────────────────────────────────────────┘
    // ```
    // ═══════════════════════════════════════════════════════════════════════
    pub fn with_sandbox_drops() -> Self {
        let mut dropper = Self::new();

        // System administration
        dropper.drop_cap(Capability::CAP_SYS_ADMIN);
        dropper.drop_cap(Capability::CAP_SYS_PTRACE);
        dropper.drop_cap(Capability::CAP_SYS_MODULE);
        dropper.drop_cap(Capability::CAP_SYS_BOOT);
        dropper.drop_cap(Capability::CAP_SYS_RAWIO);
        dropper.drop_cap(Capability::CAP_SYS_CHROOT);
        dropper.drop_cap(Capability::CAP_SYS_TIME);

        // Networking
        dropper.drop_cap(Capability::CAP_NET_ADMIN);
        dropper.drop_cap(Capability::CAP_NET_RAW);

        // Identity and permission bypass
        dropper.drop_cap(Capability::CAP_SETUID);
        dropper.drop_cap(Capability::CAP_SETGID);
        dropper.drop_cap(Capability::CAP_SETPCAP);
        dropper.drop_cap(Capability::CAP_DAC_OVERRIDE);
        dropper.drop_cap(Capability::CAP_DAC_READ_SEARCH);
        dropper.drop_cap(Capability::CAP_FOWNER);

        // Devices and audit
        dropper.drop_cap(Capability::CAP_MKNOD);
        dropper.drop_cap(Capability::CAP_AUDIT_CONTROL);
        dropper.drop_cap(Capability::CAP_SYSLOG);
        dropper.drop_cap(Capability::CAP_MAC_ADMIN);
        dropper.drop_cap(Capability::CAP_MAC_OVERRIDE);
        dropper.drop_cap(Capability::CAP_LINUX_IMMUTABLE);

        dropper
    }

    /// Add a capability to the drop list
    pub fn drop_cap(&mut self, cap: Capability) -> &mut Self {
        if !self.caps_to_drop.contains(&cap) {
            self.caps_to_drop.push(cap);
        }
        self
    }

    pub fn drop_count(&self) -> usize {
        self.caps_to_drop.len()
    }

    /// Names of the capabilities being dropped (for logging)
    pub fn caps_being_dropped(&self) -> Vec<String> {
        self.caps_to_drop.iter().map(|cap| cap.to_string()).collect()
    }

    /// Remove every listed capability from the calling thread's bounding set.
    ///
    /// Meant for `pre_exec`: no allocation, no locks. EPERM (no
    /// CAP_SETPCAP) and EINVAL (capability unknown to this kernel) are
    /// ignored; any other failure is returned.
    pub fn apply_bounding(&self) -> Result<(), io::Error> {
        for cap in &self.caps_to_drop {
            // SAFETY: prctl with PR_CAPBSET_DROP only reads its integer arguments.
            let rc = unsafe {
                libc::prctl(
                    libc::PR_CAPBSET_DROP,
                    cap.index() as libc::c_ulong,
                    0 as libc::c_ulong,
                    0 as libc::c_ulong,
                    0 as libc::c_ulong,
                )
            };
            if rc != 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EPERM) | Some(libc::EINVAL) => {}
                    _ => return Err(err),
                }
            }
        }
        Ok(())
    }
}

/// Whether this process could actually shrink a child's bounding set
pub fn can_drop_bounding() -> bool {
    caps::has_cap(None, caps::CapSet::Effective, Capability::CAP_SETPCAP).unwrap_or(false)
}
