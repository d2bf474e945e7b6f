//! Task Scheduler library through `ITaskService`.
//!
//! Apartment-bound: the scheduler and every folder share one
//! [`ComApartment`] through an `Rc`, so COM is uninitialised only after the
//! last of them is released, and none of them can leave the thread.

use std::rc::Rc;

use windows::Win32::System::Com::{CLSCTX_INPROC_SERVER, CoCreateInstance};
use windows::Win32::System::TaskScheduler::{
    ITaskFolder, ITaskService, TaskScheduler as TaskSchedulerClass,
};
use windows::core::{BSTR, VARIANT};

use super::{ComApartment, com_error};
use crate::session::{RawRow, SessionError, TaskFolder, TaskScheduler};

/// `TASK_ENUM_HIDDEN`: include hidden tasks.
const TASK_ENUM_HIDDEN: i32 = 1;

pub(super) struct WindowsTaskScheduler {
    service: ITaskService,
    apartment: Rc<ComApartment>,
}

impl WindowsTaskScheduler {
    pub(super) fn connect() -> Result<Self, SessionError> {
        let apartment = Rc::new(ComApartment::enter()?);
        // SAFETY: COM is initialised on this thread for as long as
        // `apartment` lives, which outlives the service.
        let service: ITaskService = unsafe {
            let service: ITaskService =
                CoCreateInstance(&TaskSchedulerClass, None, CLSCTX_INPROC_SERVER)
                    .map_err(|e| com_error("CoCreateInstance(TaskScheduler)", e))?;
            let empty = VARIANT::default();
            service
                .Connect(&empty, &empty, &empty, &empty)
                .map_err(|e| com_error("ITaskService::Connect", e))?;
            service
        };
        Ok(Self { service, apartment })
    }
}

impl TaskScheduler for WindowsTaskScheduler {
    fn root_folder(&self) -> Result<Box<dyn TaskFolder>, SessionError> {
        // SAFETY: connected service on its own thread.
        let folder = unsafe { self.service.GetFolder(&BSTR::from("\\")) }
            .map_err(|e| com_error("ITaskService::GetFolder(\\)", e))?;
        Ok(Box::new(WindowsTaskFolder::new(folder, Rc::clone(&self.apartment))?))
    }
}

struct WindowsTaskFolder {
    folder: ITaskFolder,
    path: String,
    // Declared last: released after the folder interface.
    apartment: Rc<ComApartment>,
}

impl WindowsTaskFolder {
    fn new(folder: ITaskFolder, apartment: Rc<ComApartment>) -> Result<Self, SessionError> {
        // SAFETY: live folder on the apartment thread.
        let path = unsafe { folder.Path() }
            .map_err(|e| com_error("ITaskFolder::Path", e))?
            .to_string();
        Ok(Self {
            folder,
            path,
            apartment,
        })
    }

    fn error(&self, operation: &str, e: windows::core::Error) -> SessionError {
        com_error(format!("ITaskFolder::{}({})", operation, self.path), e)
    }
}

impl TaskFolder for WindowsTaskFolder {
    fn path(&self) -> String {
        self.path.clone()
    }

    fn tasks(&self) -> Result<Vec<RawRow>, SessionError> {
        let mut rows = Vec::new();
        // SAFETY: every interface is a live object on the apartment thread;
        // collections are 1-based.
        unsafe {
            let tasks = self
                .folder
                .GetTasks(TASK_ENUM_HIDDEN)
                .map_err(|e| self.error("GetTasks", e))?;
            let count = tasks.Count().map_err(|e| self.error("GetTasks", e))?;
            for index in 1..=count {
                let task = tasks
                    .get_Item(&VARIANT::from(index))
                    .map_err(|e| self.error("GetTasks", e))?;
                let read = |e| self.error("IRegisteredTask", e);

                rows.push(
                    RawRow::new()
                        .with("Name", task.Name().map_err(read)?.to_string())
                        .with("Path", task.Path().map_err(read)?.to_string())
                        .with("Enabled", task.Enabled().map_err(read)?.as_bool())
                        .with("State", task.State().map_err(read)?.0 as u32)
                        .with("NumberOfMissedRuns", task.NumberOfMissedRuns().map_err(read)?)
                        // HRESULT bits, reinterpreted unsigned.
                        .with("LastTaskResult", task.LastTaskResult().map_err(read)? as u32),
                );
            }
        }
        Ok(rows)
    }

    fn folders(&self) -> Result<Vec<Box<dyn TaskFolder>>, SessionError> {
        let mut out: Vec<Box<dyn TaskFolder>> = Vec::new();
        // SAFETY: as in `tasks`.
        unsafe {
            let folders = self
                .folder
                .GetFolders(0)
                .map_err(|e| self.error("GetFolders", e))?;
            let count = folders.Count().map_err(|e| self.error("GetFolders", e))?;
            for index in 1..=count {
                let folder = folders
                    .get_Item(&VARIANT::from(index))
                    .map_err(|e| self.error("GetFolders", e))?;
                out.push(Box::new(WindowsTaskFolder::new(
                    folder,
                    Rc::clone(&self.apartment),
                )?));
            }
        }
        Ok(out)
    }
}
