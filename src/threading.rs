//! Best-effort OS thread priority for the scheduler threads.
//!
//! The dispatch thread's pacing accuracy depends on being woken promptly after its coarse sleep, so
//! it asks for a real-time policy where the platform allows it. Failures (missing privileges,
//! unsupported platform) are logged and otherwise ignored.

use tracing::debug;

/// Scheduling class requested for a pipeline thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPriority {
    /// Timing-sensitive work (dispatch pacing).
    Realtime,
    /// Latency-sensitive but not paced (ingress).
    High,
    /// Housekeeping (statistics).
    Background,
}

/// Apply `priority` to the calling thread.
///
/// # Platform Support
/// - **Linux**: `pthread_setschedparam` with `SCHED_FIFO` (Realtime), `SCHED_RR` (High) or
///   `SCHED_OTHER` (Background). Real-time policies need `CAP_SYS_NICE`.
/// - **macOS**: QoS classes via `pthread_set_qos_class_self_np`.
/// - **Other platforms**: no-op.
pub fn set_thread_priority(priority: ThreadPriority) {
    #[cfg(target_os = "linux")]
    {
        use libc::{pthread_self, pthread_setschedparam, sched_param, SCHED_FIFO, SCHED_OTHER, SCHED_RR};

        let (policy, level) = match priority {
            ThreadPriority::Realtime => (SCHED_FIFO, 70),
            ThreadPriority::High => (SCHED_RR, 30),
            ThreadPriority::Background => (SCHED_OTHER, 0),
        };

        // SAFETY: `sched_param` is plain data and the call only affects the current thread.
        let result = unsafe {
            let mut param: sched_param = std::mem::zeroed();
            param.sched_priority = level;
            pthread_setschedparam(pthread_self(), policy, &param)
        };
        if result != 0 {
            debug!(?priority, errno = result, "thread priority not applied");
        }
    }
    #[cfg(target_os = "macos")]
    {
        const QOS_CLASS_USER_INTERACTIVE: u32 = 0x21;
        const QOS_CLASS_USER_INITIATED: u32 = 0x19;
        const QOS_CLASS_UTILITY: u32 = 0x11;

        extern "C" {
            fn pthread_set_qos_class_self_np(qos_class: u32, relative_priority: i32) -> i32;
        }

        let qos_class = match priority {
            ThreadPriority::Realtime => QOS_CLASS_USER_INTERACTIVE,
            ThreadPriority::High => QOS_CLASS_USER_INITIATED,
            ThreadPriority::Background => QOS_CLASS_UTILITY,
        };
        // SAFETY: documented libSystem call affecting only the current thread.
        let result = unsafe { pthread_set_qos_class_self_np(qos_class, 0) };
        if result != 0 {
            debug!(?priority, errno = result, "thread QoS class not applied");
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        debug!(?priority, "thread priority unsupported on this platform");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_priority_is_always_allowed() {
        // Must not panic regardless of privileges.
        std::thread::spawn(|| set_thread_priority(ThreadPriority::Background))
            .join()
            .unwrap();
    }
}
