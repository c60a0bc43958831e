//! Per-second message budgets.
//!
//! Senders are keyed by pid in a fixed table of [`QUOTA_SLOTS`] slots. A pid
//! probes [`QUOTA_PROBES`] consecutive slots from its home slot; if none is
//! free or already its own, the probed slot with the lowest remaining budget
//! is taken over. The evicted sender starts over with a full budget the next
//! time it is seen, so heavy collision makes the quota more generous, never
//! stricter.
//!
//! The whole table is rebuilt when the wall-clock second changes. Kernel
//! records share one separate budget.

/// Slots in the sender table.
pub const QUOTA_SLOTS: usize = 8192;
/// Slots probed before evicting.
pub const QUOTA_PROBES: usize = 8;

/// Outcome of charging one record against a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaStatus {
    /// Within budget.
    Ok,
    /// First record over budget this second: rewrite it as the notice.
    Exceeded,
    /// Already over budget this second.
    Drop,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    pid: i64,
    /// Records left this second; `-1` once the notice has been issued.
    remaining: i64,
}

#[derive(Debug)]
pub struct QuotaTable {
    slots: Vec<Option<Slot>>,
    second: i64,
    kernel: Option<i64>,
}

impl Default for QuotaTable {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaTable {
    pub fn new() -> Self {
        Self {
            slots: vec![None; QUOTA_SLOTS],
            second: i64::MIN,
            kernel: None,
        }
    }

    fn roll(&mut self, now: i64) {
        if now != self.second {
            self.slots.iter_mut().for_each(|s| *s = None);
            self.kernel = None;
            self.second = now;
        }
    }

    /// Charge one record from `pid`. A `limit` of 0 disables the quota.
    pub fn check(&mut self, pid: i64, now: i64, limit: u32) -> QuotaStatus {
        if limit == 0 {
            return QuotaStatus::Ok;
        }
        self.roll(now);
        let home = pid.rem_euclid(QUOTA_SLOTS as i64) as usize;
        let mut victim = home;
        let mut lowest = i64::MAX;
        for probe in 0..QUOTA_PROBES {
            let idx = (home + probe) % QUOTA_SLOTS;
            match &mut self.slots[idx] {
                Some(slot) if slot.pid == pid => return spend(&mut slot.remaining),
                Some(slot) => {
                    if slot.remaining < lowest {
                        lowest = slot.remaining;
                        victim = idx;
                    }
                }
                None => {
                    victim = idx;
                    break;
                }
            }
        }
        let mut slot = Slot {
            pid,
            remaining: i64::from(limit),
        };
        let status = spend(&mut slot.remaining);
        self.slots[victim] = Some(slot);
        status
    }

    /// Charge one kernel record against the shared kernel budget.
    pub fn check_kernel(&mut self, now: i64, limit: u32) -> QuotaStatus {
        if limit == 0 {
            return QuotaStatus::Ok;
        }
        self.roll(now);
        let remaining = self.kernel.get_or_insert(i64::from(limit));
        spend(remaining)
    }

    /// Senders currently tracked.
    pub fn tracked(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

fn spend(remaining: &mut i64) -> QuotaStatus {
    match *remaining {
        r if r > 0 => {
            *remaining -= 1;
            QuotaStatus::Ok
        }
        0 => {
            *remaining = -1;
            QuotaStatus::Exceeded
        }
        _ => QuotaStatus::Drop,
    }
}
