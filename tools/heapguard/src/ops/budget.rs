use anyhow::{bail, Result};

pub const DEFAULT_THREAD_COUNT: u64 = 200;
pub const DEFAULT_STACK_KIB: u64 = 256;

const MIB: u64 = 1024 * 1024;

const CODE_CACHE_MIB: u64 = 128;
const COMPRESSED_CLASS_SPACE_MIB: u64 = 64;

// Metaspace and direct buffers each get an eighth of the limit, never less than this.
const MIN_METASPACE_MIB: u64 = 128;
const MIN_DIRECT_MIB: u64 = 128;

const RESERVE_PERCENT: u64 = 8;
const INIT_HEAP_PERCENT: u64 = 30;
const MAX_HEAP_PERCENT: u64 = 60;

/// How a container memory limit is split between the heap and everything else.
///
/// All values are MiB. Construct through [`MemoryBudget::compute`], which refuses
/// limits too small to leave any heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    pub total_mib: u64,
    pub metaspace_mib: u64,
    pub direct_mib: u64,
    pub code_cache_mib: u64,
    pub compressed_class_space_mib: u64,
    pub stack_reserve_mib: u64,
    pub reserve_mib: u64,
    pub heap_budget_mib: u64,
    pub init_heap_mib: u64,
    pub max_heap_mib: u64,
}

impl MemoryBudget {
    pub fn compute(total_bytes: u64, thread_count: u64, stack_kib: u64) -> Result<Self> {
        let total_mib = total_bytes / MIB;

        let metaspace_mib = (total_mib / 8).max(MIN_METASPACE_MIB);
        let direct_mib = (total_mib / 8).max(MIN_DIRECT_MIB);
        let stack_reserve_mib = thread_count.saturating_mul(stack_kib) / 1024;
        let reserve_mib = total_mib * RESERVE_PERCENT / 100;

        let off_heap_mib = metaspace_mib
            + direct_mib
            + CODE_CACHE_MIB
            + COMPRESSED_CLASS_SPACE_MIB
            + stack_reserve_mib;
        let claimed_mib = off_heap_mib.saturating_add(reserve_mib);

        if claimed_mib >= total_mib {
            bail!(
                "memory limit of {total_mib} MiB is too small: off-heap reservations \
                 ({off_heap_mib} MiB) plus the {RESERVE_PERCENT}% reserve ({reserve_mib} MiB) \
                 leave no heap"
            );
        }

        let heap_budget_mib = total_mib - claimed_mib;

        let budget = Self {
            total_mib,
            metaspace_mib,
            direct_mib,
            code_cache_mib: CODE_CACHE_MIB,
            compressed_class_space_mib: COMPRESSED_CLASS_SPACE_MIB,
            stack_reserve_mib,
            reserve_mib,
            heap_budget_mib,
            init_heap_mib: heap_budget_mib * INIT_HEAP_PERCENT / 100,
            max_heap_mib: heap_budget_mib * MAX_HEAP_PERCENT / 100,
        };

        tracing::info!(
            total_mib = budget.total_mib,
            metaspace_mib = budget.metaspace_mib,
            direct_mib = budget.direct_mib,
            code_cache_mib = budget.code_cache_mib,
            compressed_class_space_mib = budget.compressed_class_space_mib,
            stack_reserve_mib = budget.stack_reserve_mib,
            off_heap_mib = budget.off_heap_mib(),
            reserve_mib = budget.reserve_mib,
            heap_budget_mib = budget.heap_budget_mib,
            init_heap_mib = budget.init_heap_mib,
            max_heap_mib = budget.max_heap_mib,
            "memory budget"
        );

        Ok(budget)
    }

    pub fn off_heap_mib(&self) -> u64 {
        self.metaspace_mib
            + self.direct_mib
            + self.code_cache_mib
            + self.compressed_class_space_mib
            + self.stack_reserve_mib
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn mib(n: u64) -> u64 {
        n * MIB
    }

    #[test]
    fn two_gib_container() {
        let budget =
            MemoryBudget::compute(mib(2048), DEFAULT_THREAD_COUNT, DEFAULT_STACK_KIB).unwrap();

        assert_eq!(
            budget,
            MemoryBudget {
                total_mib: 2048,
                metaspace_mib: 256,
                direct_mib: 256,
                code_cache_mib: 128,
                compressed_class_space_mib: 64,
                stack_reserve_mib: 50,
                reserve_mib: 163,
                heap_budget_mib: 1131,
                init_heap_mib: 339,
                max_heap_mib: 678,
            }
        );
    }

    #[test]
    fn half_gib_container_is_fatal() {
        let err = MemoryBudget::compute(mib(512), DEFAULT_THREAD_COUNT, DEFAULT_STACK_KIB)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("512 MiB"), "{msg}");
        assert!(msg.contains("leave no heap"), "{msg}");
    }

    #[test]
    fn exact_exhaustion_is_fatal() {
        // 1024 MiB: 128 + 128 + 128 + 64 + stack + 81 reserve; pick the stack to consume the rest.
        let stack_mib = 1024 - (128 + 128 + 128 + 64 + 81);
        assert!(MemoryBudget::compute(mib(1024), stack_mib, 1024).is_err());
        assert!(MemoryBudget::compute(mib(1024), stack_mib - 1, 1024).is_ok());
    }

    #[test]
    fn zero_limit_is_fatal() {
        assert!(MemoryBudget::compute(0, DEFAULT_THREAD_COUNT, DEFAULT_STACK_KIB).is_err());
        assert!(MemoryBudget::compute(MIB - 1, 0, 0).is_err());
    }

    #[test]
    fn sub_mib_remainder_is_truncated() {
        let exact = MemoryBudget::compute(mib(4096), 200, 256).unwrap();
        let ragged = MemoryBudget::compute(mib(4096) + MIB - 1, 200, 256).unwrap();
        assert_eq!(exact, ragged);
    }

    #[test]
    fn stack_reserve_tracks_thread_hint() {
        let budget = MemoryBudget::compute(mib(4096), 500, 1024).unwrap();
        assert_eq!(budget.stack_reserve_mib, 500);
        assert_eq!(budget.off_heap_mib(), 512 + 512 + 128 + 64 + 500);
    }

    proptest! {
        #[test]
        fn partition_adds_up(total_mib in 1u64..1_048_576, threads in 0u64..2_000, stack_kib in 0u64..4_096) {
            if let Ok(b) = MemoryBudget::compute(mib(total_mib), threads, stack_kib) {
                prop_assert_eq!(b.total_mib, total_mib);
                prop_assert_eq!(b.heap_budget_mib + b.off_heap_mib() + b.reserve_mib, total_mib);
                prop_assert_eq!(b.reserve_mib, total_mib * 8 / 100);
                prop_assert_eq!(b.stack_reserve_mib, threads * stack_kib / 1024);
                prop_assert!(b.heap_budget_mib > 0);
                prop_assert!(b.init_heap_mib <= b.max_heap_mib);
                prop_assert!(b.max_heap_mib <= b.heap_budget_mib);
                prop_assert_eq!(b.init_heap_mib, b.heap_budget_mib * 30 / 100);
                prop_assert_eq!(b.max_heap_mib, b.heap_budget_mib * 60 / 100);
                if total_mib >= 1024 {
                    prop_assert_eq!(b.metaspace_mib, total_mib / 8);
                    prop_assert_eq!(b.direct_mib, total_mib / 8);
                }
            } else {
                let meta = (total_mib / 8).max(128);
                let claimed = 2 * meta + 128 + 64 + threads * stack_kib / 1024 + total_mib * 8 / 100;
                prop_assert!(claimed >= total_mib);
            }
        }

        #[test]
        fn compute_is_pure(total_mib in 1u64..65_536, threads in 0u64..1_000, stack_kib in 0u64..2_048) {
            let a = MemoryBudget::compute(mib(total_mib), threads, stack_kib).ok();
            let b = MemoryBudget::compute(mib(total_mib), threads, stack_kib).ok();
            prop_assert_eq!(a, b);
        }
    }
}
