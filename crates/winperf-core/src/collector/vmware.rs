//! VMware guest counters (`VM Processor`, `VM Memory`) from VMware Tools.
//!
//! Both counter handles are opened in `build`. A guest without VMware Tools
//! has neither object; both failures are reported together.

use std::sync::Arc;

use tracing::debug;

use crate::collector::{BuildContext, Collector};
use crate::config::VmwareSettings;
use crate::counter_row;
use crate::error::{CollectorError, ErrorList};
use crate::mapper::{FromRow, map_rows, validate_counters};
use crate::metric::Desc;
use crate::session::{CounterKind, CounterQuery, CounterSetSpec, Instances, NativeSession};
use crate::sink::SampleSink;
use crate::util::{mb_to_bytes, ms_to_sec};

pub const NAME: &str = "vmware";

pub const CPU_OBJECT: &str = "VM Processor";
pub const MEMORY_OBJECT: &str = "VM Memory";

counter_row! {
    pub struct CpuRow {
        #[source = "Limit in MHz"]
        pub limit_mhz: f64,
        #[source = "Reservation in MHz"]
        pub reservation_mhz: f64,
        #[source = "Shares"]
        pub shares: f64,
        /// Milliseconds.
        #[source = "CPU stolen time"]
        pub stolen_ms: f64,
        /// Milliseconds.
        #[source = "% Processor Time"]
        pub processor_time_ms: f64,
        #[source = "Effective VM Speed in MHz"]
        pub effective_vm_speed_mhz: f64,
        #[source = "Host processor speed in MHz"]
        pub host_processor_speed_mhz: f64,
    }
}

counter_row! {
    pub struct MemoryRow {
        #[source = "Memory Active in MB"]
        pub active_mb: f64,
        #[source = "Memory Ballooned in MB"]
        pub ballooned_mb: f64,
        #[source = "Memory Limit in MB"]
        pub limit_mb: f64,
        #[source = "Memory Mapped in MB"]
        pub mapped_mb: f64,
        #[source = "Memory Overhead in MB"]
        pub overhead_mb: f64,
        #[source = "Memory Reservation in MB"]
        pub reservation_mb: f64,
        #[source = "Memory Shared in MB"]
        pub shared_mb: f64,
        #[source = "Memory Shared Saved in MB"]
        pub shared_saved_mb: f64,
        #[source = "Memory Shares"]
        pub shares: f64,
        #[source = "Memory Swapped in MB"]
        pub swapped_mb: f64,
        #[source = "Memory Target Size"]
        pub target_size_mb: f64,
        #[source = "Memory Used in MB"]
        pub used_mb: f64,
    }
}

struct CpuDescs {
    limit_mhz: Arc<Desc>,
    reservation_mhz: Arc<Desc>,
    shares: Arc<Desc>,
    stolen_seconds: Arc<Desc>,
    time_seconds: Arc<Desc>,
    effective_vm_speed_mhz: Arc<Desc>,
    host_processor_speed_mhz: Arc<Desc>,
}

struct MemoryDescs {
    active: Arc<Desc>,
    ballooned: Arc<Desc>,
    limit: Arc<Desc>,
    mapped: Arc<Desc>,
    overhead: Arc<Desc>,
    reservation: Arc<Desc>,
    shared: Arc<Desc>,
    shared_saved: Arc<Desc>,
    shares: Arc<Desc>,
    swapped: Arc<Desc>,
    target_size: Arc<Desc>,
    used: Arc<Desc>,
}

pub struct Vmware {
    cpu_query: Option<Box<dyn CounterQuery>>,
    memory_query: Option<Box<dyn CounterQuery>>,
    cpu: Option<CpuDescs>,
    memory: Option<MemoryDescs>,
}

impl Vmware {
    pub fn new(_settings: &VmwareSettings) -> Self {
        Self {
            cpu_query: None,
            memory_query: None,
            cpu: None,
            memory: None,
        }
    }
}

fn open<T: FromRow>(
    session: &dyn NativeSession,
    object: &str,
    instances: Instances,
) -> Result<Box<dyn CounterQuery>, CollectorError> {
    let spec = CounterSetSpec::for_row::<T>(object, instances, CounterKind::Raw);
    let handle = session.open_counters(&spec).map_err(|e| {
        CollectorError::session(format!("failed to create {} collector", object), e)
    })?;
    validate_counters::<T>(handle.resolved()).map_err(|e| {
        CollectorError::mapping(format!("failed to create {} collector", object), e)
    })?;
    Ok(handle)
}

/// Polls `handle` and maps the first instance row.
fn first_row<T: FromRow>(handle: &mut dyn CounterQuery) -> Result<T, CollectorError> {
    let object = handle.object().to_string();
    let raw = handle
        .collect()
        .map_err(|e| CollectorError::session(format!("failed to collect {} metrics", object), e))?;
    let mut rows: Vec<T> = map_rows(&raw).map_err(|e| CollectorError::mapping(&object, e))?;
    if rows.is_empty() {
        return Err(CollectorError::NoData(format!("{} returned no instances", object)));
    }
    Ok(rows.swap_remove(0))
}

impl Vmware {
    fn build_cpu(ctx: &mut BuildContext<'_>) -> Result<CpuDescs, CollectorError> {
        Ok(CpuDescs {
            limit_mhz: ctx.desc(
                NAME,
                "cpu_limit_mhz",
                "The maximum processing power in MHz allowed to the virtual machine. Assigning a CPU Limit ensures that this virtual machine never consumes more than a certain amount of the available processor power. By limiting the amount of processing power consumed, a portion of the processing power becomes available to other virtual machines.",
                &[],
            )?,
            reservation_mhz: ctx.desc(
                NAME,
                "cpu_reservation_mhz",
                "The minimum processing power in MHz available to the virtual machine. Assigning a CPU Reservation ensures that even as other virtual machines on the same host consume shared processing power, there is still a certain minimum amount for this virtual machine.",
                &[],
            )?,
            shares: ctx.desc(
                NAME,
                "cpu_shares",
                "The number of CPU shares allocated to the virtual machine.",
                &[],
            )?,
            stolen_seconds: ctx.desc(
                NAME,
                "cpu_stolen_seconds_total",
                "The time that the VM was runnable but not scheduled to run.",
                &[],
            )?,
            time_seconds: ctx.desc(
                NAME,
                "cpu_time_seconds_total",
                "Current load of the VM's virtual processor",
                &[],
            )?,
            effective_vm_speed_mhz: ctx.desc(
                NAME,
                "cpu_effective_vm_speed_mhz_total",
                "The effective speed of the VM's virtual CPU",
                &[],
            )?,
            host_processor_speed_mhz: ctx.desc(
                NAME,
                "host_processor_speed_mhz",
                "Host Processor speed",
                &[],
            )?,
        })
    }

    fn build_memory(ctx: &mut BuildContext<'_>) -> Result<MemoryDescs, CollectorError> {
        Ok(MemoryDescs {
            active: ctx.desc(
                NAME,
                "mem_active_bytes",
                "The estimated amount of memory the virtual machine is actively using.",
                &[],
            )?,
            ballooned: ctx.desc(
                NAME,
                "mem_ballooned_bytes",
                "The amount of memory that has been reclaimed from this virtual machine via the VMware Memory Balloon mechanism.",
                &[],
            )?,
            limit: ctx.desc(
                NAME,
                "mem_limit_bytes",
                "The maximum amount of memory that is allowed to the virtual machine. Assigning a Memory Limit ensures that this virtual machine never consumes more than a certain amount of the allowed memory. By limiting the amount of memory consumed, a portion of this shared resource is allowed to other virtual machines.",
                &[],
            )?,
            mapped: ctx.desc(
                NAME,
                "mem_mapped_bytes",
                "The mapped memory size of this virtual machine. This is the current total amount of guest memory that is backed by physical memory. Note that this number may include pages of memory shared between multiple virtual machines and thus may be an overestimate of the amount of physical host memory consumed by this virtual machine.",
                &[],
            )?,
            overhead: ctx.desc(
                NAME,
                "mem_overhead_bytes",
                "The amount of overhead memory associated with this virtual machine consumed on the host system.",
                &[],
            )?,
            reservation: ctx.desc(
                NAME,
                "mem_reservation_bytes",
                "The minimum amount of memory that is guaranteed to the virtual machine. Assigning a Memory Reservation ensures that even as other virtual machines on the same host consume memory, there is still a certain minimum amount for this virtual machine.",
                &[],
            )?,
            shared: ctx.desc(
                NAME,
                "mem_shared_bytes",
                "The amount of physical memory associated with this virtual machine that is copy-on-write (COW) shared on the host.",
                &[],
            )?,
            shared_saved: ctx.desc(
                NAME,
                "mem_shared_saved_bytes",
                "The estimated amount of physical memory on the host saved from copy-on-write (COW) shared guest physical memory.",
                &[],
            )?,
            shares: ctx.desc(
                NAME,
                "mem_shares",
                "The number of memory shares allocated to the virtual machine.",
                &[],
            )?,
            swapped: ctx.desc(
                NAME,
                "mem_swapped_bytes",
                "The amount of memory associated with this virtual machine that has been swapped by ESX.",
                &[],
            )?,
            target_size: ctx.desc(NAME, "mem_target_size_bytes", "Memory Target Size.", &[])?,
            used: ctx.desc(
                NAME,
                "mem_used_bytes",
                "The estimated amount of physical host memory currently consumed for this virtual machine's physical memory.",
                &[],
            )?,
        })
    }

    fn collect_cpu(&mut self, sink: &SampleSink) -> Result<(), CollectorError> {
        let (Some(handle), Some(d)) = (self.cpu_query.as_deref_mut(), &self.cpu) else {
            return Ok(());
        };
        let row: CpuRow = first_row(handle)?;

        sink.gauge(&d.limit_mhz, row.limit_mhz, &[])?;
        sink.gauge(&d.reservation_mhz, row.reservation_mhz, &[])?;
        sink.gauge(&d.shares, row.shares, &[])?;
        sink.counter(&d.stolen_seconds, ms_to_sec(row.stolen_ms), &[])?;
        sink.counter(&d.time_seconds, ms_to_sec(row.processor_time_ms), &[])?;
        sink.gauge(&d.effective_vm_speed_mhz, row.effective_vm_speed_mhz, &[])?;
        sink.gauge(&d.host_processor_speed_mhz, row.host_processor_speed_mhz, &[])?;
        Ok(())
    }

    fn collect_memory(&mut self, sink: &SampleSink) -> Result<(), CollectorError> {
        let (Some(handle), Some(d)) = (self.memory_query.as_deref_mut(), &self.memory) else {
            return Ok(());
        };
        let row: MemoryRow = first_row(handle)?;

        sink.gauge(&d.active, mb_to_bytes(row.active_mb), &[])?;
        sink.gauge(&d.ballooned, mb_to_bytes(row.ballooned_mb), &[])?;
        sink.gauge(&d.limit, mb_to_bytes(row.limit_mb), &[])?;
        sink.gauge(&d.mapped, mb_to_bytes(row.mapped_mb), &[])?;
        sink.gauge(&d.overhead, mb_to_bytes(row.overhead_mb), &[])?;
        sink.gauge(&d.reservation, mb_to_bytes(row.reservation_mb), &[])?;
        sink.gauge(&d.shared, mb_to_bytes(row.shared_mb), &[])?;
        sink.gauge(&d.shared_saved, mb_to_bytes(row.shared_saved_mb), &[])?;
        sink.gauge(&d.shares, row.shares, &[])?;
        sink.gauge(&d.swapped, mb_to_bytes(row.swapped_mb), &[])?;
        sink.gauge(&d.target_size, mb_to_bytes(row.target_size_mb), &[])?;
        sink.gauge(&d.used, mb_to_bytes(row.used_mb), &[])?;
        Ok(())
    }
}

impl Collector for Vmware {
    fn name(&self) -> &'static str {
        NAME
    }

    fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), CollectorError> {
        let session = Arc::clone(ctx.session());
        let mut errors = ErrorList::new();

        self.cpu_query = errors.check(open::<CpuRow>(
            session.as_ref(),
            CPU_OBJECT,
            Instances::total(),
        ));
        self.memory_query = errors.check(open::<MemoryRow>(
            session.as_ref(),
            MEMORY_OBJECT,
            Instances::Single,
        ));

        if self.cpu_query.is_some() {
            self.cpu = errors.check(Self::build_cpu(ctx));
        }
        if self.memory_query.is_some() {
            self.memory = errors.check(Self::build_memory(ctx));
        }

        debug!(
            cpu = self.cpu.is_some(),
            memory = self.memory.is_some(),
            "vmware counter handles opened"
        );
        errors.finish()
    }

    fn collect(&mut self, sink: &SampleSink) -> Result<(), CollectorError> {
        let mut errors = ErrorList::new();
        errors.check(self.collect_cpu(sink));
        errors.check(self.collect_memory(sink));
        errors.finish()
    }

    fn close(&mut self) -> Result<(), CollectorError> {
        // Dropping the handles closes the native queries.
        self.cpu_query = None;
        self.memory_query = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::testing;
    use crate::session::{MockSession, RawRow, SessionError};

    fn built(session: &MockSession) -> (Vmware, Vec<Arc<Desc>>) {
        let mut collector = Vmware::new(&VmwareSettings::default());
        let descs = testing::build(&mut collector, Arc::new(session.clone())).unwrap();
        (collector, descs)
    }

    #[test]
    fn converts_units() {
        let session = MockSession::typical_host();
        let (mut collector, descs) = built(&session);
        let (result, samples) = testing::collect(&mut collector, &descs);
        result.unwrap();
        assert_eq!(samples.len(), 19);

        let value = |name: &str| testing::value(&samples, name, &[]);
        // _Total instance, not vCPU 0.
        assert_eq!(value("windows_vmware_cpu_shares"), Some(2000.0));
        assert_eq!(value("windows_vmware_cpu_stolen_seconds_total"), Some(1.5));
        assert_eq!(value("windows_vmware_cpu_time_seconds_total"), Some(250.0));
        assert_eq!(value("windows_vmware_mem_active_bytes"), Some(1024.0 * 1048576.0));
        assert_eq!(value("windows_vmware_mem_shares"), Some(81920.0));
        assert_eq!(
            value("windows_vmware_mem_target_size_bytes"),
            Some(4096.0 * 1048576.0)
        );
    }

    #[test]
    fn missing_objects_are_reported_together() {
        let session = MockSession::dotnet_only();
        let mut collector = Vmware::new(&VmwareSettings::default());
        let err = testing::build(&mut collector, Arc::new(session.clone())).unwrap_err();

        assert_eq!(err.count(), 2);
        let msg = err.to_string();
        assert!(msg.contains("VM Processor"));
        assert!(msg.contains("VM Memory"));
        assert_eq!(session.open_handles(), 0);
    }

    #[test]
    fn unresolved_counter_fails_build() {
        let session = MockSession::typical_host();
        session.set_counter_object(
            MEMORY_OBJECT,
            &["Memory Active in MB"],
            vec![RawRow::new().with("Memory Active in MB", 1.0)],
        );
        let mut collector = Vmware::new(&VmwareSettings::default());
        let err = testing::build(&mut collector, Arc::new(session)).unwrap_err();
        assert!(matches!(err, CollectorError::Mapping { .. }));
        assert!(err.to_string().contains("Memory Used in MB"));
    }

    #[test]
    fn cpu_failure_still_emits_memory() {
        let session = MockSession::typical_host();
        let (mut collector, descs) = built(&session);
        session.fail_collect(CPU_OBJECT, 0xC000_0BB8, "The specified object was not found");

        let (result, samples) = testing::collect(&mut collector, &descs);
        let err = result.unwrap_err();
        assert!(matches!(
            err,
            CollectorError::Session {
                source: SessionError::Native { .. },
                ..
            }
        ));
        assert_eq!(samples.len(), 12);
        assert!(samples.iter().all(|s| s.desc.fq_name().contains("_mem_")));
    }

    #[test]
    fn empty_result_is_an_error_not_a_panic() {
        let session = MockSession::typical_host();
        let (mut collector, descs) = built(&session);
        session.set_counter_rows(CPU_OBJECT, Vec::new());
        session.set_counter_rows(MEMORY_OBJECT, Vec::new());

        let (result, samples) = testing::collect(&mut collector, &descs);
        let err = result.unwrap_err();
        assert_eq!(err.count(), 2);
        assert!(matches!(err, CollectorError::Joined(_)));
        assert!(samples.is_empty());
    }

    #[test]
    fn values_follow_data_between_polls() {
        let session = MockSession::typical_host();
        let (mut collector, descs) = built(&session);
        let (_, first) = testing::collect(&mut collector, &descs);
        let (_, again) = testing::collect(&mut collector, &descs);
        assert_eq!(first, again);

        session.set_counter_rows(
            CPU_OBJECT,
            vec![
                RawRow::new()
                    .with("Name", "_Total")
                    .with("Limit in MHz", 4000.0)
                    .with("Reservation in MHz", 1000.0)
                    .with("Shares", 2000.0)
                    .with("CPU stolen time", 3000.0)
                    .with("% Processor Time", 260_000.0)
                    .with("Effective VM Speed in MHz", 2400.0)
                    .with("Host processor speed in MHz", 2600.0),
            ],
        );
        let (_, later) = testing::collect(&mut collector, &descs);
        assert_eq!(
            testing::value(&later, "windows_vmware_cpu_stolen_seconds_total", &[]),
            Some(3.0)
        );
    }

    #[test]
    fn close_releases_handles() {
        let session = MockSession::typical_host();
        let (mut collector, _) = built(&session);
        assert_eq!(session.open_handles(), 2);
        collector.close().unwrap();
        assert_eq!(session.open_handles(), 0);
    }
}
