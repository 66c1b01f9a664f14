/// Overall percentage of a pipeline whose phase `phase` (zero based) out of
/// `total_phases` is `local` percent done. Each phase owns an equal slice
/// `[left, right]` and `local` is mapped onto it.
pub fn blend_percent(phase: usize, total_phases: usize, local: u8) -> u8 {
    let total = total_phases.max(1) as u64;
    let phase = (phase as u64).min(total - 1);
    let left = phase * 100 / total;
    let right = (phase + 1) * 100 / total;
    let local = u64::from(local.min(100));
    (left + (right - left) * local / 100) as u8
}

/// Byte counterpart of [`blend_percent`]: `done` of `phase_total` bytes in the
/// current phase, expressed against the task's `task_total`.
pub fn blend_bytes(
    phase: usize,
    total_phases: usize,
    done: u64,
    phase_total: u64,
    task_total: u64,
) -> u64 {
    let total = total_phases.max(1) as u128;
    let phase = (phase as u128).min(total - 1);
    let local = if phase_total == 0 {
        0
    } else {
        u128::from(task_total) * u128::from(done.min(phase_total)) / u128::from(phase_total)
    };
    ((phase * u128::from(task_total) + local) / total) as u64
}
