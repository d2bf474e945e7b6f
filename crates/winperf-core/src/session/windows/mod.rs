//! [`NativeSession`] over the real Windows subsystems.
//!
//! - WMI selects through `IWbemLocator` / `IWbemServices::ExecQuery`
//! - performance counters through PDH
//! - the Task Scheduler library through `ITaskService`
//!
//! Every entry point initialises COM for the calling thread (multithreaded
//! apartment) and releases it again once the last interface obtained on
//! that thread is gone.

#![allow(unsafe_code)]

mod pdh;
mod taskschd;
mod wmi;

use std::marker::PhantomData;

use tracing::debug;
use windows::Win32::System::Com::{COINIT_MULTITHREADED, CoInitializeEx, CoUninitialize};

use crate::session::{
    CounterQuery, CounterSetSpec, NativeSession, Query, RawRow, SessionError, TaskScheduler,
};

/// Wraps a failed COM call, keeping its HRESULT and system message.
pub(crate) fn com_error(operation: impl Into<String>, e: windows::core::Error) -> SessionError {
    SessionError::native(operation, e.code().0 as u32, e.message().to_string())
}

/// COM initialisation of the current thread; uninitialises on drop.
///
/// Not `Send`: it must be dropped on the thread that created it.
pub(crate) struct ComApartment {
    _thread_bound: PhantomData<*const ()>,
}

impl ComApartment {
    pub(crate) fn enter() -> Result<Self, SessionError> {
        // SAFETY: plain COM initialisation; S_FALSE (already initialised)
        // is a success and still has to be balanced by CoUninitialize.
        unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) }
            .ok()
            .map_err(|e| com_error("CoInitializeEx", e))?;
        Ok(Self {
            _thread_bound: PhantomData,
        })
    }
}

impl Drop for ComApartment {
    fn drop(&mut self) {
        // SAFETY: balanced with the successful CoInitializeEx in `enter`.
        unsafe { CoUninitialize() };
    }
}

/// Live session against the local machine.
#[derive(Debug, Default, Clone)]
pub struct WindowsSession {}

impl WindowsSession {
    pub fn new() -> Self {
        debug!("using native Windows session");
        Self {}
    }
}

impl NativeSession for WindowsSession {
    fn query(&self, namespace: &str, query: &Query) -> Result<Vec<RawRow>, SessionError> {
        let _com = ComApartment::enter()?;
        wmi::exec_query(namespace, query)
    }

    fn open_counters(&self, spec: &CounterSetSpec) -> Result<Box<dyn CounterQuery>, SessionError> {
        Ok(Box::new(pdh::PdhCounterQuery::open(spec)?))
    }

    fn connect_task_scheduler(&self) -> Result<Box<dyn TaskScheduler>, SessionError> {
        Ok(Box::new(taskschd::WindowsTaskScheduler::connect()?))
    }
}

/// Converts a NUL-terminated UTF-16 string owned by the OS.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated UTF-16 string.
pub(crate) unsafe fn wide_to_string(ptr: *const u16) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let mut len = 0;
    // SAFETY: guaranteed NUL-terminated by the caller.
    unsafe {
        while *ptr.add(len) != 0 {
            len += 1;
        }
        String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
    }
}

pub(crate) fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}
