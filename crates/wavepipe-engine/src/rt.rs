//! Scheduling for engine threads.

/// Moves the calling thread to SCHED_FIFO at `priority`. Failure (usually a
/// missing rtprio limit) is logged and the thread keeps its normal policy.
#[cfg(target_os = "linux")]
pub fn promote_current_thread(priority: i32) {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: `param` is a valid sched_param for the duration of the call and
    // pthread_self() always names the calling thread.
    let result =
        unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if result != 0 {
        tracing::warn!(
            priority,
            errno = result,
            "failed to elevate engine thread priority"
        );
    } else {
        tracing::debug!(priority, "engine thread running with SCHED_FIFO");
    }
}

#[cfg(not(target_os = "linux"))]
pub fn promote_current_thread(priority: i32) {
    tracing::debug!(priority, "realtime priority is only supported on Linux");
}
