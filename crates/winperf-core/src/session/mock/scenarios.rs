//! Pre-built mock host states for testing.

use super::session::{MockFolder, MockSession, MockTask};
use crate::session::{RawRow, Value, task_state};

/// `LastTaskResult` of a task that never ran.
const HAS_NOT_RUN: u32 = 0x0004_1303;

fn clr_exceptions(name: &str, thrown: u32, filters: u32, finallys: u32, depth: u32) -> RawRow {
    RawRow::new()
        .with("Name", name)
        .with("NumberofExcepsThrown", thrown)
        .with("NumberofExcepsThrownPersec", thrown)
        .with("NumberofFiltersPersec", filters)
        .with("NumberofFinallysPersec", finallys)
        .with("ThrowToCatchDepthPersec", depth)
}

fn clr_jit(name: &str, methods: u32, time: u32, frequency: &str, failures: u32, il: u32) -> RawRow {
    RawRow::new()
        .with("Name", name)
        // uint64 properties arrive as strings over WMI.
        .with("Frequency_PerfTime", Value::Str(frequency.to_string()))
        .with("ILBytesJittedPersec", il)
        .with("NumberofILBytesJitted", il)
        .with("NumberofMethodsJitted", methods)
        .with("PercentTimeinJit", time)
        .with("StandardJitFailures", failures)
        .with("TotalNumberofILBytesJitted", il)
}

const VM_PROCESSOR_COUNTERS: &[&str] = &[
    "Limit in MHz",
    "Reservation in MHz",
    "Shares",
    "CPU stolen time",
    "% Processor Time",
    "Effective VM Speed in MHz",
    "Host processor speed in MHz",
];

const VM_MEMORY_COUNTERS: &[&str] = &[
    "Memory Active in MB",
    "Memory Ballooned in MB",
    "Memory Limit in MB",
    "Memory Mapped in MB",
    "Memory Overhead in MB",
    "Memory Reservation in MB",
    "Memory Shared in MB",
    "Memory Shared Saved in MB",
    "Memory Shares",
    "Memory Swapped in MB",
    "Memory Target Size",
    "Memory Used in MB",
];

impl MockSession {
    fn add_dotnet_processes(&self) {
        self.set_rows(
            "Win32_PerfRawData_NETFramework_NETCLRExceptions",
            vec![
                clr_exceptions("_Global_", 160, 12, 410, 33),
                clr_exceptions("w3wp", 120, 10, 400, 30),
                clr_exceptions("dotnet", 40, 2, 10, 3),
                clr_exceptions("PowerShell", 0, 0, 0, 0),
            ],
        );
        self.set_rows(
            "Win32_PerfRawData_NETFramework_NETCLRJit",
            vec![
                clr_jit("_Global_", 9000, 70, "100", 1, 2_000_000),
                clr_jit("w3wp", 7000, 50, "100", 1, 1_500_000),
                clr_jit("dotnet", 2000, 2_500_000, "10000000", 0, 500_000),
                clr_jit("PowerShell", 0, 0, "0", 0, 0),
            ],
        );
    }

    /// A VMware guest running IIS and a couple of .NET tools, with a small
    /// task library.
    ///
    /// Includes:
    /// - both CLR classes with a `_Global_` row and three processes
    /// - `VM Processor` (`_Total` and one vCPU) and `VM Memory`
    /// - tasks in every state, one that never ran, one that failed
    pub fn typical_host() -> Self {
        let session = Self::new();
        session.add_dotnet_processes();

        session.set_counter_object(
            "VM Processor",
            VM_PROCESSOR_COUNTERS,
            vec![
                RawRow::new()
                    .with("Name", "_Total")
                    .with("Limit in MHz", 4000.0)
                    .with("Reservation in MHz", 1000.0)
                    .with("Shares", 2000.0)
                    .with("CPU stolen time", 1500.0)
                    .with("% Processor Time", 250_000.0)
                    .with("Effective VM Speed in MHz", 2400.0)
                    .with("Host processor speed in MHz", 2600.0),
                RawRow::new()
                    .with("Name", "0")
                    .with("Limit in MHz", 2000.0)
                    .with("Reservation in MHz", 500.0)
                    .with("Shares", 1000.0)
                    .with("CPU stolen time", 750.0)
                    .with("% Processor Time", 125_000.0)
                    .with("Effective VM Speed in MHz", 1200.0)
                    .with("Host processor speed in MHz", 2600.0),
            ],
        );

        session.set_counter_object(
            "VM Memory",
            VM_MEMORY_COUNTERS,
            vec![
                RawRow::new()
                    .with("Memory Active in MB", 1024.0)
                    .with("Memory Ballooned in MB", 0.0)
                    .with("Memory Limit in MB", 8192.0)
                    .with("Memory Mapped in MB", 4096.0)
                    .with("Memory Overhead in MB", 64.0)
                    .with("Memory Reservation in MB", 2048.0)
                    .with("Memory Shared in MB", 128.0)
                    .with("Memory Shared Saved in MB", 96.0)
                    .with("Memory Shares", 81920.0)
                    .with("Memory Swapped in MB", 0.0)
                    .with("Memory Target Size", 4096.0)
                    .with("Memory Used in MB", 3900.0),
            ],
        );

        session.set_task_root(
            MockFolder::new("")
                .with_task(MockTask::new("Backup", task_state::READY))
                .with_task(
                    MockTask::new("Sync", task_state::RUNNING)
                        .with_last_result(0x0000_0001)
                        .with_missed_runs(2),
                )
                .with_folder(
                    MockFolder::new("Microsoft").with_folder(
                        MockFolder::new("Windows")
                            .with_folder(MockFolder::new("Defrag").with_task(
                                MockTask::new("ScheduledDefrag", task_state::READY)
                                    .with_last_result(HAS_NOT_RUN),
                            ))
                            .with_folder(
                                MockFolder::new("UpdateOrchestrator")
                                    .with_task(MockTask::new("Schedule Scan", task_state::DISABLED))
                                    .with_task(MockTask::new("Reboot", task_state::QUEUED)),
                            ),
                    ),
                ),
        );

        session
    }

    /// A physical host with .NET processes and nothing else: no VMware
    /// counter objects and an empty task library.
    pub fn dotnet_only() -> Self {
        let session = Self::new();
        session.add_dotnet_processes();
        session
    }

    /// A task library nested `depth` folders deep.
    ///
    /// Every level holds one task, a `Deeper` folder continuing the chain and
    /// a `Side` sibling folder with one task, so there are `2 * depth + 1`
    /// tasks in total.
    pub fn deep_task_tree(depth: usize) -> Self {
        let mut folder = MockFolder::new("Deeper")
            .with_task(MockTask::new(format!("task_{}", depth), task_state::READY));
        for level in (1..depth).rev() {
            folder = MockFolder::new("Deeper")
                .with_task(MockTask::new(format!("task_{}", level), task_state::READY))
                .with_folder(
                    MockFolder::new("Side")
                        .with_task(MockTask::new(format!("side_{}", level), task_state::QUEUED)),
                )
                .with_folder(folder);
        }

        let mut root = MockFolder::new("").with_task(MockTask::new("task_0", task_state::READY));
        if depth > 0 {
            root = root
                .with_folder(
                    MockFolder::new("Side")
                        .with_task(MockTask::new("side_0", task_state::QUEUED)),
                )
                .with_folder(folder);
        }

        let session = Self::new();
        session.set_task_root(root);
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::{Container, walk_depth_first};
    use crate::session::{NAMESPACE_ROOT_CIMV2, NativeSession, Query};

    #[test]
    fn typical_host_has_global_row() {
        let session = MockSession::typical_host();
        let rows = session
            .query(
                NAMESPACE_ROOT_CIMV2,
                &Query::new("SELECT * FROM Win32_PerfRawData_NETFramework_NETCLRJit").unwrap(),
            )
            .unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].get("Name"), Some(&Value::Str("_Global_".into())));
    }

    #[test]
    fn deep_tree_has_expected_task_count() {
        for depth in [0usize, 1, 2, 5, 20] {
            let session = MockSession::deep_task_tree(depth);
            let scheduler = session.connect_task_scheduler().unwrap();
            let root = scheduler.root_folder().unwrap();

            let mut count = 0;
            walk_depth_first(root, |_| {
                count += 1;
                Ok(())
            })
            .unwrap();
            assert_eq!(count, 2 * depth + 1, "depth {}", depth);
        }
    }

    #[test]
    fn task_folder_key_is_path() {
        let session = MockSession::deep_task_tree(1);
        let scheduler = session.connect_task_scheduler().unwrap();
        let root = scheduler.root_folder().unwrap();
        assert_eq!(root.key(), "\\");
    }
}
