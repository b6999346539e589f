//! Small helpers shared by the memory layers.

/// Round `addr` down to a power-of-two boundary. Slot and page arithmetic
/// all over the heap relies on this, so the alignment really must be a
/// power of two.
#[inline(always)]
pub fn align_down(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    addr & !(align - 1)
}

/// Render a byte count the way the heap logs like to read: `64B`, `2.0KiB`,
/// `512.0MiB`. Sizes in this crate span 16 B slots to 512 MiB objects, so
/// three binary steps are all that is ever needed.
pub fn human_size(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}B", bytes)
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}
