//! WMI selects.

use windows::Win32::System::Com::{CLSCTX_INPROC_SERVER, CoCreateInstance};
use windows::Win32::System::Variant::{
    VT_BOOL, VT_BSTR, VT_EMPTY, VT_I1, VT_I2, VT_I4, VT_I8, VT_NULL, VT_R4, VT_R8, VT_UI1, VT_UI2,
    VT_UI4, VT_UI8,
};
use windows::Win32::System::Wmi::{
    CIM_FLAG_ARRAY, CIM_UINT8, CIM_UINT16, CIM_UINT32, IEnumWbemClassObject, IWbemClassObject,
    IWbemLocator, WBEM_FLAG_FORWARD_ONLY, WBEM_FLAG_NONSYSTEM_ONLY, WBEM_FLAG_RETURN_IMMEDIATELY,
    WBEM_INFINITE, WbemLocator,
};
use windows::core::{BSTR, VARIANT};

use super::com_error;
use crate::session::{Query, RawRow, SessionError, Value};

/// `WBEM_E_INVALID_CLASS`
const WBEM_E_INVALID_CLASS: u32 = 0x8004_1010;
/// `WBEM_E_INVALID_NAMESPACE`
const WBEM_E_INVALID_NAMESPACE: u32 = 0x8004_100E;

/// Runs `query` in `namespace` (`root/cimv2` style) and copies every row out.
///
/// The calling thread must have COM initialised.
pub(super) fn exec_query(namespace: &str, query: &Query) -> Result<Vec<RawRow>, SessionError> {
    // SAFETY: COM is initialised by the caller; every interface below is
    // released by its Drop before this function returns.
    unsafe {
        let locator: IWbemLocator = CoCreateInstance(&WbemLocator, None, CLSCTX_INPROC_SERVER)
            .map_err(|e| com_error("CoCreateInstance(WbemLocator)", e))?;

        let resource = BSTR::from(namespace.replace('/', "\\"));
        let services = locator
            .ConnectServer(
                &resource,
                &BSTR::new(),
                &BSTR::new(),
                &BSTR::new(),
                0,
                &BSTR::new(),
                None,
            )
            .map_err(|e| not_found_or(e, namespace, format!("ConnectServer({})", namespace)))?;

        let rows = services
            .ExecQuery(
                &BSTR::from("WQL"),
                &BSTR::from(query.text()),
                WBEM_FLAG_FORWARD_ONLY | WBEM_FLAG_RETURN_IMMEDIATELY,
                None,
            )
            .map_err(|e| not_found_or(e, query.class(), format!("ExecQuery({})", query.class())))?;

        drain(&rows, query)
    }
}

fn not_found_or(e: windows::core::Error, name: &str, operation: String) -> SessionError {
    match e.code().0 as u32 {
        WBEM_E_INVALID_CLASS | WBEM_E_INVALID_NAMESPACE => {
            SessionError::ObjectNotFound(name.to_string())
        }
        _ => com_error(operation, e),
    }
}

/// Reads the whole enumerator; a failure anywhere discards every row.
unsafe fn drain(rows: &IEnumWbemClassObject, query: &Query) -> Result<Vec<RawRow>, SessionError> {
    let mut out = Vec::new();
    loop {
        let mut objects = [None; 1];
        let mut returned = 0u32;
        // SAFETY: `objects` has room for the one object requested.
        let hr = unsafe { rows.Next(WBEM_INFINITE, &mut objects, &mut returned) };
        hr.ok()
            .map_err(|e| com_error(format!("IEnumWbemClassObject::Next({})", query.class()), e))?;
        if returned == 0 {
            break;
        }
        if let [Some(object)] = objects {
            // SAFETY: a live object handed out by the enumerator.
            out.push(unsafe { read_object(&object, query) }?);
        }
    }
    Ok(out)
}

unsafe fn read_object(object: &IWbemClassObject, query: &Query) -> Result<RawRow, SessionError> {
    let operation = || format!("IWbemClassObject::Next({})", query.class());
    let mut row = RawRow::new();

    // SAFETY: enumeration of a live object; name and value are owned by
    // BSTR and VARIANT and freed on drop.
    unsafe {
        object
            .BeginEnumeration(WBEM_FLAG_NONSYSTEM_ONLY.0)
            .map_err(|e| com_error(operation(), e))?;
        loop {
            let mut name = BSTR::new();
            let mut value = VARIANT::default();
            let mut cimtype = 0i32;
            object
                .Next(0, &mut name, &mut value, &mut cimtype, std::ptr::null_mut())
                .map_err(|e| com_error(operation(), e))?;
            // WBEM_S_NO_MORE_DATA leaves the name empty.
            if name.is_empty() {
                break;
            }
            row.insert(name.to_string(), with_cim_type(from_variant(&value), cimtype));
        }
        object.EndEnumeration().map_err(|e| com_error(operation(), e))?;
    }
    Ok(row)
}

/// Copies a property value into an owned [`Value`].
///
/// CIM `uint64`/`sint64` properties arrive as `VT_BSTR` and stay strings;
/// the mapper parses them.
fn from_variant(value: &VARIANT) -> Value {
    let vt = value.vt();
    let converted = match vt {
        VT_EMPTY | VT_NULL => None,
        VT_BOOL => bool::try_from(value).ok().map(Value::Bool),
        VT_I1 | VT_I2 | VT_I4 => i32::try_from(value).ok().map(Value::I32),
        VT_UI1 | VT_UI2 | VT_UI4 => u32::try_from(value).ok().map(Value::U32),
        VT_I8 => i64::try_from(value).ok().map(Value::I64),
        VT_UI8 => u64::try_from(value).ok().map(Value::U64),
        VT_R4 | VT_R8 => f64::try_from(value).ok().map(Value::F64),
        VT_BSTR => BSTR::try_from(value).ok().map(|s| Value::Str(s.to_string())),
        _ => None,
    };
    converted.unwrap_or(Value::Null)
}

/// Restores the declared signedness of a property.
///
/// WMI has no unsigned VARIANT types on the wire: `uint8`, `uint16` and
/// `uint32` arrive as `VT_UI1`, `VT_I2` and `VT_I4`. The bits are kept and
/// read back as unsigned, so `4294967295` does not become `-1`.
fn with_cim_type(value: Value, cimtype: i32) -> Value {
    if cimtype & CIM_FLAG_ARRAY.0 != 0 {
        return value;
    }
    match (value, cimtype) {
        (Value::I32(v), t) if t == CIM_UINT32.0 => Value::U32(v as u32),
        (Value::I32(v), t) if t == CIM_UINT16.0 => Value::U32(u32::from(v as u16)),
        (Value::I32(v), t) if t == CIM_UINT8.0 => Value::U32(u32::from(v as u8)),
        (value, _) => value,
    }
}
