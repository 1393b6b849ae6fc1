//! The `fs` host module: filesystem helpers.
//!
//! All helpers are synchronous except `readFileAsync`, which follows the
//! same bridge pattern as `net.getAsync`.

use std::fs;

use crate::runtime::{worker, ResumeToken};
use crate::vm::{NativeFn, Table, Value, VmError};

use super::{check_string, HostModule};

pub struct FsModule;

impl HostModule for FsModule {
    fn name(&self) -> &'static str {
        "fs"
    }

    fn exports(&self) -> Vec<NativeFn> {
        vec![
            NativeFn::sync("readFile", |_cx, args| {
                let path = check_string("readFile", &args, 0)?;
                let contents = fs::read_to_string(&path)
                    .map_err(|e| VmError::script(format!("failed to read {}: {}", path, e)))?;
                Ok(vec![Value::from(contents)])
            }),
            NativeFn::sync("writeFile", |_cx, args| {
                let path = check_string("writeFile", &args, 0)?;
                let contents = check_string("writeFile", &args, 1)?;
                fs::write(&path, contents)
                    .map_err(|e| VmError::script(format!("failed to write {}: {}", path, e)))?;
                Ok(Vec::new())
            }),
            NativeFn::sync("appendFile", |_cx, args| {
                let path = check_string("appendFile", &args, 0)?;
                let contents = check_string("appendFile", &args, 1)?;
                use std::io::Write;
                let mut file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| VmError::script(format!("failed to open {}: {}", path, e)))?;
                file.write_all(contents.as_bytes())
                    .map_err(|e| VmError::script(format!("failed to write {}: {}", path, e)))?;
                Ok(Vec::new())
            }),
            NativeFn::sync("exists", |_cx, args| {
                let path = check_string("exists", &args, 0)?;
                Ok(vec![Value::from(fs::metadata(&path).is_ok())])
            }),
            NativeFn::sync("listDir", |_cx, args| {
                let path = check_string("listDir", &args, 0)?;
                let entries = fs::read_dir(&path)
                    .map_err(|e| VmError::script(format!("failed to list {}: {}", path, e)))?;
                let mut names: Vec<String> = entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name().to_string_lossy().to_string())
                    .collect();
                names.sort();
                let table = Table::new();
                for (i, name) in names.into_iter().enumerate() {
                    table.set(Value::Number((i + 1) as f64), Value::from(name));
                }
                Ok(vec![Value::Table(table)])
            }),
            NativeFn::new("readFileAsync", |cx, args| {
                Box::pin(async move {
                    let path = check_string("readFileAsync", &args, 0)?;
                    let token = ResumeToken::acquire(&cx)?;
                    worker::submit(move || match fs::read_to_string(&path) {
                        Ok(contents) => {
                            token.complete(move |_rt| vec![Value::from(contents)])
                        }
                        Err(err) => {
                            token.fail(format!("failed to read {}: {}", path, err))
                        }
                    });
                    cx.suspend().await
                })
            }),
        ]
    }
}
