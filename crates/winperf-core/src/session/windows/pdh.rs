//! PDH performance-counter queries.

use std::collections::BTreeMap;

use tracing::{debug, trace};
use windows::Win32::System::Performance::{
    PDH_FMT_COUNTERVALUE_ITEM_W, PDH_FMT_DOUBLE, PDH_HCOUNTER, PDH_HQUERY, PDH_RAW_COUNTER_ITEM_W,
    PdhAddEnglishCounterW, PdhCloseQuery, PdhCollectQueryData, PdhGetFormattedCounterArrayW,
    PdhGetRawCounterArrayW, PdhOpenQueryW,
};
use windows::core::PCWSTR;

use super::{to_wide, wide_to_string};
use crate::session::{
    CounterKind, CounterQuery, CounterSetSpec, INSTANCE_FIELD, RawRow, SessionError, Value,
};

const ERROR_SUCCESS: u32 = 0;
const PDH_MORE_DATA: u32 = 0x8000_07D2;
const PDH_CSTATUS_NO_OBJECT: u32 = 0xC000_0BB8;
const PDH_CSTATUS_NO_COUNTER: u32 = 0xC000_0BB9;
const PDH_CSTATUS_NO_INSTANCE: u32 = 0x8000_07D1;
/// Formatted values need two samples; the first collect reports this.
const PDH_INVALID_DATA: u32 = 0xC000_0BC6;

fn pdh_error(operation: impl Into<String>, status: u32) -> SessionError {
    SessionError::native(operation, status, "PDH call failed")
}

/// One open PDH query covering every counter of one object.
pub(super) struct PdhCounterQuery {
    object: String,
    kind: CounterKind,
    query: PDH_HQUERY,
    /// Resolved counter name and the handles of its paths.
    counters: Vec<(String, Vec<PDH_HCOUNTER>)>,
    resolved: Vec<String>,
    primed: bool,
}

// SAFETY: PDH query and counter handles are process-wide identifiers, not
// bound to the opening thread; `&mut self` serialises their use.
unsafe impl Send for PdhCounterQuery {}

impl PdhCounterQuery {
    pub(super) fn open(spec: &CounterSetSpec) -> Result<Self, SessionError> {
        let mut query = PDH_HQUERY::default();
        // SAFETY: out-pointer to a local handle; closed in Drop.
        let status = unsafe { PdhOpenQueryW(PCWSTR::null(), 0, &mut query) };
        if status != ERROR_SUCCESS {
            return Err(pdh_error("PdhOpenQuery", status));
        }

        let mut handle = Self {
            object: spec.object.clone(),
            kind: spec.kind,
            query,
            counters: Vec::new(),
            resolved: Vec::new(),
            primed: false,
        };

        for counter in &spec.counters {
            let mut handles = Vec::new();
            for path in spec.counter_paths(counter) {
                let wide = to_wide(&path);
                let mut hcounter = PDH_HCOUNTER::default();
                // SAFETY: `wide` outlives the call; the counter belongs to
                // `query` and is freed with it.
                let status = unsafe {
                    PdhAddEnglishCounterW(
                        handle.query,
                        PCWSTR::from_raw(wide.as_ptr()),
                        0,
                        &mut hcounter,
                    )
                };
                match status {
                    ERROR_SUCCESS => handles.push(hcounter),
                    PDH_CSTATUS_NO_OBJECT => {
                        return Err(SessionError::ObjectNotFound(spec.object.clone()));
                    }
                    PDH_CSTATUS_NO_COUNTER | PDH_CSTATUS_NO_INSTANCE => {
                        debug!(
                            path = %path,
                            status = format!("0x{:08X}", status),
                            "counter not available"
                        );
                    }
                    other => {
                        return Err(pdh_error(format!("PdhAddEnglishCounter({})", path), other));
                    }
                }
            }
            if !handles.is_empty() {
                handle.resolved.push(counter.clone());
                handle.counters.push((counter.clone(), handles));
            }
        }

        Ok(handle)
    }

    fn poll(&mut self) -> Result<(), SessionError> {
        // SAFETY: `self.query` is open until Drop.
        let status = unsafe { PdhCollectQueryData(self.query) };
        if status != ERROR_SUCCESS {
            return Err(pdh_error(format!("PdhCollectQueryData({})", self.object), status));
        }
        Ok(())
    }
}

/// Fills `buffer` through a sizing call followed by the real one.
///
/// `call(size, count, buffer)` is one PDH array function.
fn read_array<T, F>(operation: &str, mut call: F) -> Result<Vec<T>, SessionError>
where
    F: FnMut(&mut u32, &mut u32, Option<*mut T>) -> u32,
{
    let mut size = 0u32;
    let mut count = 0u32;
    let status = call(&mut size, &mut count, None);
    if status != PDH_MORE_DATA {
        if status == ERROR_SUCCESS {
            return Ok(Vec::new());
        }
        return Err(pdh_error(operation, status));
    }

    let elements = (size as usize).div_ceil(std::mem::size_of::<T>());
    let mut buffer: Vec<T> = Vec::with_capacity(elements);
    let status = call(&mut size, &mut count, Some(buffer.as_mut_ptr()));
    if status != ERROR_SUCCESS {
        return Err(pdh_error(operation, status));
    }
    // SAFETY: PDH wrote `count` items into the buffer it sized itself.
    unsafe { buffer.set_len(count as usize) };
    Ok(buffer)
}

impl CounterQuery for PdhCounterQuery {
    fn object(&self) -> &str {
        &self.object
    }

    fn resolved(&self) -> &[String] {
        &self.resolved
    }

    fn collect(&mut self) -> Result<Vec<RawRow>, SessionError> {
        if self.kind == CounterKind::Formatted && !self.primed {
            self.poll()?;
            self.primed = true;
        }
        self.poll()?;

        // Keyed by instance name so every counter of an instance lands in one row.
        let mut rows: BTreeMap<String, RawRow> = BTreeMap::new();
        for (counter, handles) in &self.counters {
            for &hcounter in handles {
                let operation = format!("PdhGetCounterArray({}\\{})", self.object, counter);
                let values: Vec<(String, f64)> = match self.kind {
                    CounterKind::Raw => read_array::<PDH_RAW_COUNTER_ITEM_W, _>(
                        &operation,
                        |size, count, buf| unsafe {
                            // SAFETY: sizes and buffer come from `read_array`.
                            PdhGetRawCounterArrayW(hcounter, size, count, buf)
                        },
                    )?
                    .iter()
                    // SAFETY: names point into the array buffer, still alive here.
                    .map(|item| unsafe {
                        (
                            wide_to_string(item.szName.0),
                            item.RawValue.FirstValue as f64,
                        )
                    })
                    .collect(),
                    CounterKind::Formatted => {
                        let items = match read_array::<PDH_FMT_COUNTERVALUE_ITEM_W, _>(
                            &operation,
                            |size, count, buf| unsafe {
                                // SAFETY: sizes and buffer come from `read_array`.
                                PdhGetFormattedCounterArrayW(
                                    hcounter,
                                    PDH_FMT_DOUBLE,
                                    size,
                                    count,
                                    buf,
                                )
                            },
                        ) {
                            Ok(items) => items,
                            Err(SessionError::Native { code, .. }) if code == PDH_INVALID_DATA => {
                                trace!(counter = %counter, "formatted counter not ready yet");
                                Vec::new()
                            }
                            Err(e) => return Err(e),
                        };
                        items
                            .iter()
                            // SAFETY: as above; the union holds a double for PDH_FMT_DOUBLE.
                            .map(|item| unsafe {
                                (
                                    wide_to_string(item.szName.0),
                                    item.FmtValue.Anonymous.doubleValue,
                                )
                            })
                            .collect()
                    }
                };

                for (instance, value) in values {
                    let row = rows.entry(instance.clone()).or_insert_with(|| {
                        let mut row = RawRow::new();
                        row.insert(INSTANCE_FIELD, Value::Str(instance));
                        row
                    });
                    row.insert(counter.clone(), Value::F64(value));
                }
            }
        }

        Ok(rows.into_values().collect())
    }
}

impl Drop for PdhCounterQuery {
    fn drop(&mut self) {
        // SAFETY: the query was opened in `open` and is closed exactly once.
        let status = unsafe { PdhCloseQuery(self.query) };
        if status != ERROR_SUCCESS {
            debug!(
                object = %self.object,
                status = format!("0x{:08X}", status),
                "PdhCloseQuery failed"
            );
        }
    }
}
