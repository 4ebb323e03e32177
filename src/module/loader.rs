//! Module Loaders
//!
//! The [`ModuleLoader`] trait is the hosting runtime's load-module-from-path
//! capability. [`NativeLoader`] implements it over shared libraries with
//! libloading.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use libloading::Library;
use thiserror::Error;

use super::abi::{
    AbiVersionFn, ConstructFn, DescribeFn, FreeStringFn, InvokeFn, ModuleDescriptor, ReleaseFn,
    ABI_VERSION, SYM_ABI_VERSION, SYM_CONSTRUCT, SYM_DESCRIBE, SYM_FREE_STRING, SYM_INVOKE,
    SYM_RELEASE,
};
use super::types::{Argument, TypeRef, Value};
use super::{
    Fault, InstanceFn, MethodBody, MethodDef, Module, Receiver, StaticFn, TypeDef, Visibility,
};

/// Failure to bring a module into the process
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("module '{path}' not found")]
    NotFound { path: String },

    #[error("failed to load module '{path}': {reason}")]
    Invalid { path: String, reason: String },

    #[error("module '{path}' speaks ABI version {found}, expected {expected}")]
    AbiMismatch {
        path: String,
        expected: u32,
        found: u32,
    },
}

impl LoadError {
    pub fn invalid(path: impl Into<String>, reason: impl Into<String>) -> Self {
        LoadError::Invalid {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// The path the failed load named
    pub fn path(&self) -> &str {
        match self {
            LoadError::NotFound { path }
            | LoadError::Invalid { path, .. }
            | LoadError::AbiMismatch { path, .. } => path,
        }
    }
}

/// Loads a module from a path. Implementations perform real I/O on every call;
/// caching is the registry's job.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, path: &str) -> Result<Module, LoadError>;
}

/// Loads shared libraries that export the modgate C ABI
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLoader;

impl NativeLoader {
    pub fn new() -> Self {
        Self
    }
}

impl ModuleLoader for NativeLoader {
    fn load(&self, path: &str) -> Result<Module, LoadError> {
        if !Path::new(path).exists() {
            return Err(LoadError::NotFound {
                path: path.to_string(),
            });
        }

        NativeLibrary::open(path)?.into_module()
    }
}

/// Entry points of one module, as looked up from its library
#[derive(Clone, Copy)]
struct AbiTable {
    describe: DescribeFn,
    construct: ConstructFn,
    invoke: InvokeFn,
    release: ReleaseFn,
    free_string: FreeStringFn,
}

/// A loaded shared library with its ABI entry points
struct NativeLibrary {
    path: String,
    abi: AbiTable,
    // Keeps the function pointers above valid; dropped last. `None` when the
    // entry points are linked into the host itself.
    _library: Option<Library>,
}

impl NativeLibrary {
    fn open(path: &str) -> Result<Self, LoadError> {
        // Safety: loading a library runs its initialisers. The gateway trusts
        // callers to name valid modules.
        let library = unsafe { Library::new(path) }
            .map_err(|e| LoadError::invalid(path, e.to_string()))?;

        // Safety: each symbol is looked up with the signature the ABI fixes for it.
        let abi = unsafe {
            let version: AbiVersionFn = *library
                .get::<AbiVersionFn>(SYM_ABI_VERSION)
                .map_err(|e| LoadError::invalid(path, format!("not a modgate module: {}", e)))?;
            let found = version();
            if found != ABI_VERSION {
                return Err(LoadError::AbiMismatch {
                    path: path.to_string(),
                    expected: ABI_VERSION,
                    found,
                });
            }

            AbiTable {
                describe: *symbol::<DescribeFn>(&library, path, SYM_DESCRIBE)?,
                construct: *symbol::<ConstructFn>(&library, path, SYM_CONSTRUCT)?,
                invoke: *symbol::<InvokeFn>(&library, path, SYM_INVOKE)?,
                release: *symbol::<ReleaseFn>(&library, path, SYM_RELEASE)?,
                free_string: *symbol::<FreeStringFn>(&library, path, SYM_FREE_STRING)?,
            }
        };

        Ok(Self {
            path: path.to_string(),
            abi,
            _library: Some(library),
        })
    }

    fn into_module(self) -> Result<Module, LoadError> {
        let library = Arc::new(self);
        let descriptor = library.describe()?;
        build_module(&library.path, &descriptor, &library)
    }

    fn describe(&self) -> Result<ModuleDescriptor, LoadError> {
        // Safety: the descriptor is a static NUL-terminated string owned by the module.
        let raw = unsafe { (self.abi.describe)() };
        if raw.is_null() {
            return Err(LoadError::invalid(&self.path, "module returned no descriptor"));
        }
        let json = unsafe { CStr::from_ptr(raw) }
            .to_str()
            .map_err(|e| {
                LoadError::invalid(&self.path, format!("descriptor is not UTF-8: {}", e))
            })?;
        ModuleDescriptor::from_json(json).map_err(|e| LoadError::invalid(&self.path, e))
    }

    /// Take ownership of a module-allocated string
    fn take_string(&self, ptr: *mut c_char) -> Option<String> {
        if ptr.is_null() {
            return None;
        }
        // Safety: non-null strings handed out by the module are NUL-terminated
        // and stay valid until freed below.
        let s = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
        unsafe { (self.abi.free_string)(ptr) };
        Some(s)
    }

    fn construct(self: &Arc<Self>, type_name: &CStr) -> Result<Receiver, Fault> {
        let mut handle: *mut c_void = ptr::null_mut();
        let mut error: *mut c_char = ptr::null_mut();
        // Safety: out-pointers are valid for writes for the duration of the call.
        let status = unsafe { (self.abi.construct)(type_name.as_ptr(), &mut handle, &mut error) };
        let message = self.take_string(error);
        if status != 0 {
            return Err(Fault::new(
                message.unwrap_or_else(|| format!("constructor failed with status {}", status)),
            ));
        }
        Ok(Box::new(NativeReceiver {
            library: Arc::clone(self),
            type_name: type_name.to_owned(),
            handle,
        }) as Receiver)
    }

    fn invoke(
        &self,
        type_name: &CStr,
        method: &CStr,
        handle: *mut c_void,
        args: &[Argument],
        returns: &TypeRef,
    ) -> Result<Option<Value>, Fault> {
        let args_json = serde_json::to_string(args)
            .map_err(|e| Fault::new(format!("failed to encode arguments: {}", e)))?;
        let args_json = CString::new(args_json)
            .map_err(|_| Fault::new("arguments contain an interior NUL byte"))?;

        let mut result: *mut c_char = ptr::null_mut();
        let mut error: *mut c_char = ptr::null_mut();
        // Safety: all input strings are NUL-terminated and outlive the call;
        // out-pointers are valid for writes.
        let status = unsafe {
            (self.abi.invoke)(
                type_name.as_ptr(),
                method.as_ptr(),
                handle,
                args_json.as_ptr(),
                &mut result,
                &mut error,
            )
        };
        let result = self.take_string(result);
        let message = self.take_string(error);

        if status != 0 {
            return Err(Fault::new(
                message.unwrap_or_else(|| format!("method failed with status {}", status)),
            ));
        }
        if returns.is_void() {
            return Ok(None);
        }
        match result {
            None => Ok(None),
            Some(json) => {
                let json: serde_json::Value = serde_json::from_str(&json)
                    .map_err(|e| Fault::new(format!("malformed result: {}", e)))?;
                returns.decode_json(&json).map(Some).map_err(Fault::new)
            }
        }
    }
}

/// A receiver constructed inside a native module, released on drop
struct NativeReceiver {
    library: Arc<NativeLibrary>,
    type_name: CString,
    handle: *mut c_void,
}

// Safety: the handle is only touched through the owning library's ABI calls,
// and a receiver is used by a single request at a time.
unsafe impl Send for NativeReceiver {}

impl Drop for NativeReceiver {
    fn drop(&mut self) {
        // Safety: the handle came from this library's constructor and is released once.
        unsafe { (self.library.abi.release)(self.type_name.as_ptr(), self.handle) };
    }
}

unsafe fn symbol<'lib, T>(
    library: &'lib Library,
    path: &str,
    name: &[u8],
) -> Result<libloading::Symbol<'lib, T>, LoadError> {
    library.get::<T>(name).map_err(|e| {
        let name = String::from_utf8_lossy(&name[..name.len().saturating_sub(1)]);
        LoadError::invalid(path, format!("missing symbol '{}': {}", name, e))
    })
}

fn c_string(path: &str, s: &str) -> Result<CString, LoadError> {
    CString::new(s).map_err(|_| LoadError::invalid(path, format!("name '{}' contains NUL", s)))
}

fn visibility(public: bool) -> Visibility {
    if public {
        Visibility::Public
    } else {
        Visibility::Private
    }
}

/// Turn a descriptor into a module whose method bodies call back into the library
fn build_module(
    path: &str,
    descriptor: &ModuleDescriptor,
    library: &Arc<NativeLibrary>,
) -> Result<Module, LoadError> {
    let mut module = Module::new(path);

    for ty in &descriptor.types {
        let type_name = c_string(path, &ty.name)?;
        let mut def = TypeDef::new(ty.name.clone());
        def.visibility = visibility(ty.public);

        if ty.constructible {
            let library = Arc::clone(library);
            let type_name = type_name.clone();
            def = def.with_constructor(move || library.construct(&type_name));
        }

        for method in &ty.methods {
            let signature_error =
                |e: String| LoadError::invalid(path, format!("{}.{}: {}", ty.name, method.name, e));
            let params = method
                .params
                .iter()
                .map(|p| descriptor.resolve_type(p))
                .collect::<Result<Vec<_>, _>>()
                .map_err(signature_error)?;
            let returns = descriptor
                .resolve_type(&method.returns)
                .map_err(signature_error)?;

            let library = Arc::clone(library);
            let type_name = type_name.clone();
            let method_name = c_string(path, &method.name)?;
            let ret = returns.clone();

            let body = if method.is_static {
                let f: StaticFn = Arc::new(move |args: &[Argument]| {
                    library.invoke(&type_name, &method_name, ptr::null_mut(), args, &ret)
                });
                MethodBody::Static(f)
            } else {
                let f: InstanceFn = Arc::new(move |receiver: &mut Receiver, args: &[Argument]| {
                    let handle = receiver
                        .downcast_ref::<NativeReceiver>()
                        .map(|r| r.handle)
                        .ok_or_else(|| Fault::new("receiver was not built by this module"))?;
                    library.invoke(&type_name, &method_name, handle, args, &ret)
                });
                MethodBody::Instance(f)
            };

            def.methods.push(MethodDef {
                name: method.name.clone(),
                params,
                returns,
                visibility: visibility(method.public),
                body,
            });
        }

        module = module.with_type(def);
    }

    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, MutexGuard};

    use crate::gateway::{ErrorKind, Gateway, InvocationRequest};
    use crate::invoker::{invoke, InvokeError};
    use crate::marshal::marshal;
    use crate::module::CatalogLoader;
    use crate::resolver::{resolve, ResolveError};

    /// ABI entry points implemented inside the test binary
    mod host {
        use super::*;

        pub static CONSTRUCTED: AtomicUsize = AtomicUsize::new(0);
        pub static RELEASED: AtomicUsize = AtomicUsize::new(0);
        pub static ALLOCATED: AtomicUsize = AtomicUsize::new(0);
        pub static FREED: AtomicUsize = AtomicUsize::new(0);

        const DESCRIPTOR: &str = concat!(
            r#"{
            "types": [
                {
                    "name": "Calc.Counter",
                    "constructible": true,
                    "methods": [
                        {"name": "Add", "params": ["int", "int"], "returns": "int", "static": true},
                        {"name": "Bump", "returns": "int"},
                        {"name": "Fail", "returns": "string", "static": true},
                        {"name": "Nothing", "returns": "string", "static": true},
                        {"name": "Reset", "returns": "void", "static": true},
                        {"name": "Label", "params": ["Calc.Tag"], "returns": "Calc.Tag", "static": true},
                        {"name": "Secret", "static": true, "public": false}
                    ]
                },
                {"name": "Calc.Sealed", "methods": [{"name": "Bump", "returns": "int"}]}
            ],
            "structs": [{"name": "Calc.Tag", "fields": [{"name": "Name", "type": "string"}]}]
        }"#,
            "\0"
        );

        fn out(s: &str) -> *mut c_char {
            ALLOCATED.fetch_add(1, Ordering::SeqCst);
            CString::new(s).map(CString::into_raw).unwrap_or(ptr::null_mut())
        }

        unsafe extern "C" fn describe() -> *const c_char {
            DESCRIPTOR.as_ptr().cast()
        }

        unsafe extern "C" fn construct(
            type_name: *const c_char,
            handle: *mut *mut c_void,
            error: *mut *mut c_char,
        ) -> i32 {
            if CStr::from_ptr(type_name).to_bytes() != b"Calc.Counter" {
                *error = out("no such type");
                return 1;
            }
            CONSTRUCTED.fetch_add(1, Ordering::SeqCst);
            *handle = Box::into_raw(Box::new(0i64)).cast();
            0
        }

        unsafe extern "C" fn invoke(
            _type_name: *const c_char,
            method: *const c_char,
            handle: *mut c_void,
            args_json: *const c_char,
            result: *mut *mut c_char,
            error: *mut *mut c_char,
        ) -> i32 {
            let args: Vec<serde_json::Value> =
                serde_json::from_slice(CStr::from_ptr(args_json).to_bytes()).unwrap_or_default();
            let int = |i: usize| {
                args.get(i)
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(0)
            };

            match CStr::from_ptr(method).to_bytes() {
                b"Add" => {
                    *result = out(&(int(0) + int(1)).to_string());
                    0
                }
                b"Bump" => {
                    let count = &mut *handle.cast::<i64>();
                    *count += 1;
                    *result = out(&count.to_string());
                    0
                }
                b"Fail" => {
                    *error = out("calculator jammed");
                    2
                }
                b"Nothing" => 0,
                b"Reset" => {
                    *result = out("\"ignored\"");
                    0
                }
                b"Label" => {
                    let name = args
                        .first()
                        .and_then(|v| v.get("Name"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("?");
                    *result = out(&serde_json::json!({ "Name": format!("{}!", name) }).to_string());
                    0
                }
                _ => {
                    *error = out("unknown method");
                    1
                }
            }
        }

        unsafe extern "C" fn release(_type_name: *const c_char, handle: *mut c_void) {
            drop(Box::from_raw(handle.cast::<i64>()));
            RELEASED.fetch_add(1, Ordering::SeqCst);
        }

        unsafe extern "C" fn free_string(s: *mut c_char) {
            drop(CString::from_raw(s));
            FREED.fetch_add(1, Ordering::SeqCst);
        }

        pub fn table() -> AbiTable {
            AbiTable {
                describe,
                construct,
                invoke,
                release,
                free_string,
            }
        }
    }

    /// The counters above are process-wide, so host-module tests run one at a time
    fn serial() -> MutexGuard<'static, ()> {
        static SERIAL: Mutex<()> = Mutex::new(());
        SERIAL.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn host_library(path: &str) -> NativeLibrary {
        NativeLibrary {
            path: path.to_string(),
            abi: host::table(),
            _library: None,
        }
    }

    fn host_module() -> Module {
        host_library("host://calc").into_module().unwrap()
    }

    fn call(
        module: &Module,
        ty: &str,
        method: &str,
        raw: &[&str],
    ) -> Result<Option<Value>, InvokeError> {
        let method = resolve(module, ty, method).unwrap();
        let raw: Vec<String> = raw.iter().map(|s| s.to_string()).collect();
        let args = marshal(&method.params, &raw).unwrap();
        invoke(&method, &args)
    }

    fn strings_balanced() -> bool {
        host::ALLOCATED.load(Ordering::SeqCst) == host::FREED.load(Ordering::SeqCst)
    }

    #[test]
    fn test_native_module_signatures() {
        let _guard = serial();
        let module = host_module();

        assert_eq!(module.origin(), "host://calc");
        let counter = module.find_type("Calc.Counter").unwrap();
        assert!(counter.constructor.is_some());

        let add = counter.methods_named("Add").next().unwrap();
        assert!(add.is_static());
        assert_eq!(add.params.len(), 2);
        assert_eq!(add.returns.name(), "int");

        let label = counter.methods_named("Label").next().unwrap();
        assert_eq!(label.params[0].name(), "Calc.Tag");

        let sealed = module.find_type("Calc.Sealed").unwrap();
        assert!(sealed.constructor.is_none());

        let err = resolve(&module, "Calc.Counter", "Secret").unwrap_err();
        assert!(matches!(err, ResolveError::MethodNotInvocable { .. }));
    }

    #[test]
    fn test_native_static_calls() {
        let _guard = serial();
        let module = host_module();
        let constructed = host::CONSTRUCTED.load(Ordering::SeqCst);

        let sum = call(&module, "Calc.Counter", "Add", &["2", "3"]).unwrap();
        assert_eq!(sum, Some(Value::Int(5)));

        let tag = call(&module, "Calc.Counter", "Label", &[r#"{"Name":"lot"}"#])
            .unwrap()
            .unwrap();
        let tag = tag.as_struct().unwrap();
        assert_eq!(tag.type_name, "Calc.Tag");
        assert_eq!(tag.get("Name").and_then(Value::as_str), Some("lot!"));

        assert_eq!(host::CONSTRUCTED.load(Ordering::SeqCst), constructed);
        assert!(strings_balanced());
    }

    #[test]
    fn test_native_instance_calls_release_each_receiver() {
        let _guard = serial();
        let module = host_module();
        let constructed = host::CONSTRUCTED.load(Ordering::SeqCst);
        let released = host::RELEASED.load(Ordering::SeqCst);

        let first = call(&module, "Calc.Counter", "Bump", &[]).unwrap();
        let second = call(&module, "Calc.Counter", "Bump", &[]).unwrap();
        assert_eq!(first, Some(Value::Int(1)));
        assert_eq!(second, Some(Value::Int(1)));

        assert_eq!(host::CONSTRUCTED.load(Ordering::SeqCst) - constructed, 2);
        assert_eq!(host::RELEASED.load(Ordering::SeqCst) - released, 2);
        assert!(strings_balanced());

        let err = call(&module, "Calc.Sealed", "Bump", &[]).unwrap_err();
        assert!(matches!(err, InvokeError::ReceiverConstruction { .. }));
    }

    #[test]
    fn test_native_nonzero_status_is_target_invocation() {
        let _guard = serial();
        let module = host_module();

        let err = call(&module, "Calc.Counter", "Fail", &[]).unwrap_err();
        assert_eq!(
            err,
            InvokeError::TargetInvocation {
                type_name: "Calc.Counter".into(),
                method: "Fail".into(),
                fault: Fault::new("calculator jammed"),
            }
        );
        assert!(strings_balanced());
    }

    #[test]
    fn test_native_null_and_void_results() {
        let _guard = serial();
        let module = host_module();

        assert_eq!(call(&module, "Calc.Counter", "Nothing", &[]).unwrap(), None);

        // The module still hands back a string for a void method; it is freed and ignored
        let allocated = host::ALLOCATED.load(Ordering::SeqCst);
        assert_eq!(call(&module, "Calc.Counter", "Reset", &[]).unwrap(), None);
        assert_eq!(host::ALLOCATED.load(Ordering::SeqCst) - allocated, 1);
        assert!(strings_balanced());
    }

    #[test]
    fn test_native_module_through_gateway() {
        let _guard = serial();
        let gateway = Gateway::new(
            CatalogLoader::new()
                .with_module("host://calc", |path| host_library(path).into_module()),
        );

        let request = InvocationRequest::new("host://calc", "Calc.Counter", "Add")
            .param("40")
            .param("2");
        assert_eq!(gateway.invoke(&request).unwrap().result, "42");

        let request = InvocationRequest::new("host://calc", "Calc.Counter", "Fail");
        let err = gateway.invoke(&request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TargetInvocationError);
        assert!(err.to_string().contains("calculator jammed"));
    }

    #[test]
    fn test_missing_path_is_not_found() {
        let err = NativeLoader::new()
            .load("/definitely/not/here/libnothing.so")
            .unwrap_err();
        assert!(matches!(err, LoadError::NotFound { .. }));
        assert_eq!(err.path(), "/definitely/not/here/libnothing.so");
    }

    #[test]
    fn test_garbage_file_is_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"this is not a shared library").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let err = NativeLoader::new().load(&path).unwrap_err();
        assert!(matches!(err, LoadError::Invalid { .. }), "got {:?}", err);
        assert!(err.to_string().contains(&path));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_library_without_abi_is_invalid() {
        // libc loads fine but exports none of the modgate symbols
        let candidates = [
            "/lib/x86_64-linux-gnu/libc.so.6",
            "/usr/lib64/libc.so.6",
            "/lib64/libc.so.6",
        ];
        let Some(path) = candidates
            .into_iter()
            .find(|p| Path::new(p).exists())
        else {
            return;
        };

        let err = NativeLoader::new().load(path).unwrap_err();
        match err {
            LoadError::Invalid { reason, .. } => assert!(reason.contains("not a modgate module")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
