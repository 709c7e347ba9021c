//! Object model over the live CPython interpreter.
//!
//! Objects are inspected without running user code: attributes come from
//! `__dict__` mappings read through the `type` and module descriptors,
//! wrapper types are recognised by type identity, and native entry points are
//! read straight out of the CPython object layouts mirrored below (64-bit,
//! default build, CPython 3.8 or later).

use std::collections::HashMap;
use std::ffi::{c_char, CStr};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use pyo3::ffi;
use pyo3::prelude::*;
use pyo3::sync::GILOnceCell;
use pyo3::types::{PyDict, PyModule, PyString, PyTuple, PyType};
use tracing::debug;

use crate::bridges::discovery::is_shared_object;
use crate::bridges::object_model::{NativeKind, ObjectId, ObjectModel, ObjectShape, WrapperKind};
use crate::bridges::symbols::{library_ranges, parse_proc_maps, LoadRange};
use crate::errors::{XrayError, XrayResult};

// ---------------------------------------------------------------------------
// CPython layouts
// ---------------------------------------------------------------------------

#[allow(dead_code)]
#[repr(C)]
struct ObjectHead {
    ob_refcnt: isize,
    ob_type: usize,
}

#[allow(dead_code)]
#[repr(C)]
struct MethodDef {
    ml_name: usize,
    ml_meth: usize,
    ml_flags: i32,
    ml_doc: usize,
}

#[allow(dead_code)]
#[repr(C)]
struct CFunctionObject {
    head: ObjectHead,
    m_ml: *const MethodDef,
    m_self: *mut ffi::PyObject,
}

#[allow(dead_code)]
#[repr(C)]
struct DescrCommon {
    head: ObjectHead,
    d_type: usize,
    d_name: usize,
    d_qualname: usize,
}

#[allow(dead_code)]
#[repr(C)]
struct MethodDescrObject {
    common: DescrCommon,
    d_method: *const MethodDef,
}

#[allow(dead_code)]
#[repr(C)]
struct WrapperDescrObject {
    common: DescrCommon,
    d_base: usize,
    d_wrapped: usize,
}

#[allow(dead_code)]
#[repr(C)]
struct MethodWrapperObject {
    head: ObjectHead,
    descr: *const WrapperDescrObject,
}

#[allow(dead_code)]
#[repr(C)]
struct GetSetDef {
    name: usize,
    get: usize,
    set: usize,
}

#[allow(dead_code)]
#[repr(C)]
struct GetSetDescrObject {
    common: DescrCommon,
    d_getset: *const GetSetDef,
}

#[allow(dead_code)]
#[repr(C)]
struct UfuncObject {
    head: ObjectHead,
    nin: i32,
    nout: i32,
    nargs: i32,
    identity: i32,
    functions: *const usize,
    data: *const usize,
    ntypes: i32,
}

#[allow(dead_code)]
#[repr(C)]
struct CDataObject {
    head: ObjectHead,
    b_ptr: *const usize,
}

// PyTypeObject word indices, counted in pointer-sized words.
const TP_NAME: usize = 3;
const TP_BASICSIZE: usize = 4;
const TP_DEALLOC: usize = 6;
const TP_CALL: usize = 16;
const TP_FLAGS: usize = 21;
const TPFLAGS_HEAPTYPE: usize = 1 << 9;

/// Every function-pointer slot of a type: dealloc, getattr, setattr, repr,
/// hash, call, getattro, setattro, traverse, clear, richcompare, iter,
/// iternext, descr_get, descr_set, init, alloc, new, free, is_gc, del,
/// finalize and vectorcall.
const TYPE_SLOTS: [usize; 23] = [
    6, 8, 9, 11, 15, 16, 18, 19, 23, 24, 25, 27, 28, 34, 35, 37, 38, 39, 40, 41, 47, 49, 50,
];

// pybind11 function_record: name, doc, signature, args (3 words), impl, data[0].
const BINDING_IMPL_WORD: usize = 6;
const BINDING_DATA_WORD: usize = 7;

/// Read the `index`-th pointer-sized word of an object.
///
/// # Safety
/// `ptr` must point at a live object at least `index + 1` words long.
unsafe fn read_word(ptr: *const ffi::PyObject, index: usize) -> usize {
    *(ptr as *const usize).add(index)
}

fn nonzero(entries: impl IntoIterator<Item = usize>) -> Vec<u64> {
    entries.into_iter().filter(|&e| e != 0).map(|e| e as u64).collect()
}

// ---------------------------------------------------------------------------
// Known types
// ---------------------------------------------------------------------------

/// Builtin types recognised by identity, fetched once per interpreter.
struct KnownTypes {
    function: Py<PyType>,
    method: Py<PyType>,
    static_method: Py<PyType>,
    class_method: Py<PyType>,
    partial: Py<PyType>,
    method_descriptor: Py<PyType>,
    class_method_descriptor: Py<PyType>,
    wrapper_descriptor: Py<PyType>,
    method_wrapper: Py<PyType>,
    getset_descriptor: Py<PyType>,
    /// `tp_dealloc` shared by every class created by a `class` statement.
    python_class_dealloc: usize,
}

static KNOWN_TYPES: GILOnceCell<KnownTypes> = GILOnceCell::new();

fn type_attr(module: &Bound<'_, PyModule>, name: &str) -> PyResult<Py<PyType>> {
    Ok(module.getattr(name)?.downcast_into::<PyType>()?.unbind())
}

fn known_types(py: Python<'_>) -> PyResult<&'static KnownTypes> {
    KNOWN_TYPES.get_or_try_init(py, || {
        let types = py.import("types")?;
        let builtins = py.import("builtins")?;
        let functools = py.import("functools")?;
        let plain = py
            .get_type::<PyType>()
            .call1(("_XrayPlainClass", PyTuple::empty(py), PyDict::new(py)))?;
        // SAFETY: `plain` is a live type object.
        let python_class_dealloc = unsafe { read_word(plain.as_ptr(), TP_DEALLOC) };
        Ok(KnownTypes {
            function: type_attr(&types, "FunctionType")?,
            method: type_attr(&types, "MethodType")?,
            static_method: type_attr(&builtins, "staticmethod")?,
            class_method: type_attr(&builtins, "classmethod")?,
            partial: type_attr(&functools, "partial")?,
            method_descriptor: type_attr(&types, "MethodDescriptorType")?,
            class_method_descriptor: type_attr(&types, "ClassMethodDescriptorType")?,
            wrapper_descriptor: type_attr(&types, "WrapperDescriptorType")?,
            method_wrapper: type_attr(&types, "MethodWrapperType")?,
            getset_descriptor: type_attr(&types, "GetSetDescriptorType")?,
            python_class_dealloc,
        })
    })
}

fn is_exact(ty: &Bound<'_, PyType>, known: &Py<PyType>) -> bool {
    ty.as_ptr() == known.as_ptr()
}

// ---------------------------------------------------------------------------
// LiveRuntime
// ---------------------------------------------------------------------------

/// [`ObjectModel`] backed by the running interpreter.
///
/// Object ids are object addresses; every object handed out is kept alive
/// for the lifetime of the runtime so ids stay valid.
pub struct LiveRuntime {
    objects: Mutex<HashMap<ObjectId, Py<PyAny>>>,
}

impl Default for LiveRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveRuntime {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, obj: &Bound<'_, PyAny>) -> ObjectId {
        let id = obj.as_ptr() as usize as ObjectId;
        self.objects
            .lock()
            .entry(id)
            .or_insert_with(|| obj.clone().unbind());
        id
    }

    fn get<'py>(&self, py: Python<'py>, id: ObjectId) -> XrayResult<Bound<'py, PyAny>> {
        self.objects
            .lock()
            .get(&id)
            .map(|o| o.bind(py).clone())
            .ok_or_else(|| XrayError::Introspection(format!("unknown object {id:#x}")))
    }

    /// Make `root` importable.
    pub fn add_to_path(&self, root: &Path) -> XrayResult<()> {
        Python::with_gil(|py| -> PyResult<()> {
            let sys_path = py.import("sys")?.getattr("path")?;
            let entry = root.to_string_lossy().into_owned();
            if !sys_path.contains(&entry)? {
                sys_path.call_method1("insert", (0, entry))?;
            }
            Ok(())
        })
        .map_err(introspection)
    }
}

fn introspection(err: PyErr) -> XrayError {
    XrayError::Introspection(err.to_string())
}

/// `__dict__` of a module or class, read through the base descriptors so a
/// metaclass or module `__getattr__` cannot intercept it.
fn static_dict<'py>(py: Python<'py>, obj: &Bound<'py, PyAny>) -> PyResult<Option<Bound<'py, PyAny>>> {
    if let Ok(module) = obj.downcast::<PyModule>() {
        return Ok(Some(module.dict().into_any()));
    }
    if obj.is_instance_of::<PyType>() {
        let descriptor = py
            .get_type::<PyType>()
            .getattr("__dict__")?
            .get_item("__dict__")?;
        return Ok(Some(descriptor.call_method1("__get__", (obj,))?));
    }
    Ok(None)
}

fn instance_dict_get<'py>(obj: &Bound<'py, PyAny>, name: &str) -> Option<Bound<'py, PyAny>> {
    let py = obj.py();
    // SAFETY: generic dict lookup through the type's dict offset; returns a new reference or NULL.
    let dict = unsafe {
        Bound::from_owned_ptr_or_opt(py, ffi::PyObject_GenericGetDict(obj.as_ptr(), std::ptr::null_mut()))
    };
    let Some(dict) = dict else {
        let _ = PyErr::take(py);
        return None;
    };
    let dict = dict.downcast_into::<PyDict>().ok()?;
    dict.get_item(name).ok().flatten()
}

/// Attribute lookup through the generic algorithm only. Callers use it on
/// exact builtin wrapper types, whose attributes are member descriptors.
fn generic_attr<'py>(obj: &Bound<'py, PyAny>, name: &str) -> PyResult<Bound<'py, PyAny>> {
    let py = obj.py();
    let key = PyString::new(py, name);
    // SAFETY: both pointers are live; returns a new reference or NULL with an exception set.
    unsafe { Bound::from_owned_ptr_or_err(py, ffi::PyObject_GenericGetAttr(obj.as_ptr(), key.as_ptr())) }
}

/// `tp_name` of a type, read from the type object itself.
fn tp_name(ty: *const ffi::PyObject) -> Option<String> {
    // SAFETY: `ty` is a live type object; tp_name is NUL-terminated.
    unsafe {
        let raw = read_word(ty, TP_NAME) as *const c_char;
        if raw.is_null() {
            return None;
        }
        CStr::from_ptr(raw).to_str().ok().map(str::to_string)
    }
}

fn short_type_name(ty: *const ffi::PyObject) -> String {
    tp_name(ty)
        .map(|n| n.rsplit('.').next().unwrap_or_default().to_string())
        .unwrap_or_default()
}

fn module_file(module: &Bound<'_, PyAny>) -> Option<PathBuf> {
    let dict = module.downcast::<PyModule>().ok()?.dict();
    let file = dict.get_item("__file__").ok().flatten()?;
    let text: String = file.downcast::<PyString>().ok()?.to_str().ok()?.to_string();
    Some(PathBuf::from(text))
}

/// Module that defined a type: `__module__` from its dict, else the
/// `tp_name` prefix of a static type.
fn type_module(py: Python<'_>, ty: &Bound<'_, PyAny>) -> Option<String> {
    let from_dict = static_dict(py, ty)
        .ok()
        .flatten()
        .and_then(|d| d.get_item("__module__").ok())
        .and_then(|m| m.extract::<String>().ok());
    if from_dict.is_some() {
        return from_dict;
    }
    tp_name(ty.as_ptr()).and_then(|n| n.rsplit_once('.').map(|(module, _)| module.to_string()))
}

/// Whether a type was defined by an extension module.
fn defined_natively(py: Python<'_>, ty: &Bound<'_, PyAny>) -> bool {
    let Some(module_name) = type_module(py, ty) else {
        return false;
    };
    let modules = match py.import("sys").and_then(|s| s.getattr("modules")) {
        Ok(m) => m,
        Err(_) => return false,
    };
    let Ok(modules) = modules.downcast_into::<PyDict>() else {
        return false;
    };
    modules
        .get_item(module_name)
        .ok()
        .flatten()
        .and_then(|m| module_file(&m))
        .and_then(|f| f.file_name().map(|n| is_shared_object(&n.to_string_lossy())))
        .unwrap_or(false)
}

/// Whether a type came from a `class` statement rather than C code.
fn defined_in_python(known: &KnownTypes, ty: *const ffi::PyObject) -> bool {
    // SAFETY: `ty` is a live type object.
    let (flags, dealloc) = unsafe { (read_word(ty, TP_FLAGS), read_word(ty, TP_DEALLOC)) };
    flags & TPFLAGS_HEAPTYPE != 0 && dealloc == known.python_class_dealloc
}

fn type_shape(py: Python<'_>, ty: &Bound<'_, PyAny>) -> ObjectShape {
    let ptr = ty.as_ptr();
    // SAFETY: `ty` is a live type object; every slot read lies inside PyTypeObject.
    let (flags, slots) = unsafe {
        (
            read_word(ptr, TP_FLAGS),
            TYPE_SLOTS.map(|word| read_word(ptr, word)),
        )
    };
    if flags & TPFLAGS_HEAPTYPE != 0 && !defined_natively(py, ty) {
        return ObjectShape::InterpretedClass;
    }
    ObjectShape::Native {
        kind: NativeKind::Type,
        entries: nonzero(slots),
        declared_name: None,
    }
}

/// Entries of a builtin function, following pybind11 function records.
///
/// # Safety
/// `obj` must share the `PyCFunctionObject` layout.
unsafe fn builtin_shape(obj: &Bound<'_, PyAny>) -> ObjectShape {
    let func = obj.as_ptr() as *const CFunctionObject;
    let meth = if (*func).m_ml.is_null() { 0 } else { (*(*func).m_ml).ml_meth };
    let owner = (*func).m_self;
    if !owner.is_null() && ffi::PyCapsule_CheckExact(owner) != 0 {
        let name = ffi::PyCapsule_GetName(owner);
        let record = ffi::PyCapsule_GetPointer(owner, name) as *const ffi::PyObject;
        if record.is_null() {
            ffi::PyErr_Clear();
        } else {
            return ObjectShape::Native {
                kind: NativeKind::BindingFunction,
                entries: nonzero([
                    read_word(record, BINDING_IMPL_WORD),
                    read_word(record, BINDING_DATA_WORD),
                ]),
                declared_name: None,
            };
        }
    }
    ObjectShape::Native {
        kind: NativeKind::BuiltinFunction,
        entries: nonzero([meth]),
        declared_name: None,
    }
}

fn native(kind: NativeKind, entries: Vec<u64>) -> ObjectShape {
    ObjectShape::Native {
        kind,
        entries,
        declared_name: None,
    }
}

/// Cython's function types, which extend the builtin function layout. A
/// class statement reusing the name is rejected by its dealloc slot.
fn is_cython_function(known: &KnownTypes, ty: &Bound<'_, PyType>) -> bool {
    let ptr = ty.as_ptr();
    let name = short_type_name(ptr);
    if name != "cython_function_or_method" && name != "fused_cython_function" {
        return false;
    }
    // SAFETY: `ty` is a live type object.
    let basicsize = unsafe { read_word(ptr, TP_BASICSIZE) };
    !defined_in_python(known, ptr) && basicsize >= std::mem::size_of::<CFunctionObject>()
}

/// `numpy.ufunc`, when numpy is already loaded.
fn is_numpy_ufunc(py: Python<'_>, ty: &Bound<'_, PyType>) -> bool {
    let Ok(modules) = py.import("sys").and_then(|s| s.getattr("modules")) else {
        return false;
    };
    let Ok(modules) = modules.downcast_into::<PyDict>() else {
        return false;
    };
    let Some(numpy) = modules.get_item("numpy").ok().flatten() else {
        return false;
    };
    let Ok(numpy) = numpy.downcast_into::<PyModule>() else {
        return false;
    };
    numpy
        .dict()
        .get_item("ufunc")
        .ok()
        .flatten()
        .is_some_and(|ufunc| ufunc.as_ptr() == ty.as_ptr())
}

fn is_ctypes_function(py: Python<'_>, ty: &Bound<'_, PyType>) -> bool {
    let Ok(base) = py.import("ctypes").and_then(|c| c.getattr("_CFuncPtr")) else {
        return false;
    };
    let Ok(base) = base.downcast_into::<PyType>() else {
        return false;
    };
    // SAFETY: both are live type objects; subtype checks walk the MRO only.
    unsafe { ffi::PyType_IsSubtype(ty.as_type_ptr(), base.as_type_ptr()) != 0 }
}

fn shape_of<'py>(
    py: Python<'py>,
    obj: &Bound<'py, PyAny>,
) -> PyResult<(ObjectShape, Option<Bound<'py, PyAny>>)> {
    if obj.is_instance_of::<PyModule>() {
        return Ok((ObjectShape::Module { file: module_file(obj) }, None));
    }
    if obj.is_instance_of::<PyType>() {
        return Ok((type_shape(py, obj), None));
    }
    let known = known_types(py)?;
    let ty = obj.get_type();
    let ptr = obj.as_ptr();

    // SAFETY: each layout is read only after the object's type is confirmed
    // by identity, by a subtype check, or by its C-level slots.
    unsafe {
        if ffi::PyCFunction_Check(ptr) != 0 {
            return Ok((builtin_shape(obj), None));
        }
        if is_cython_function(known, &ty) {
            let shape = match builtin_shape(obj) {
                ObjectShape::Native { entries, .. } => native(NativeKind::CythonFunction, entries),
                other => other,
            };
            return Ok((shape, None));
        }
        if is_exact(&ty, &known.method_descriptor) || is_exact(&ty, &known.class_method_descriptor) {
            let descr = ptr as *const MethodDescrObject;
            let meth = if (*descr).d_method.is_null() { 0 } else { (*(*descr).d_method).ml_meth };
            return Ok((native(NativeKind::MethodDescriptor, nonzero([meth])), None));
        }
        if is_exact(&ty, &known.wrapper_descriptor) {
            let descr = ptr as *const WrapperDescrObject;
            return Ok((native(NativeKind::WrapperDescriptor, nonzero([(*descr).d_wrapped])), None));
        }
        if is_exact(&ty, &known.method_wrapper) {
            let wrapper = ptr as *const MethodWrapperObject;
            let wrapped = if (*wrapper).descr.is_null() { 0 } else { (*(*wrapper).descr).d_wrapped };
            return Ok((native(NativeKind::MethodWrapper, nonzero([wrapped])), None));
        }
        if is_exact(&ty, &known.getset_descriptor) {
            let descr = ptr as *const GetSetDescrObject;
            let entries = if (*descr).d_getset.is_null() {
                Vec::new()
            } else {
                nonzero([(*(*descr).d_getset).get, (*(*descr).d_getset).set])
            };
            return Ok((native(NativeKind::GetSetDescriptor, entries), None));
        }
        if is_numpy_ufunc(py, &ty) {
            let ufunc = ptr as *const UfuncObject;
            let count = (*ufunc).ntypes.max(0) as usize;
            let mut entries = Vec::with_capacity(count);
            if !(*ufunc).functions.is_null() {
                for i in 0..count {
                    entries.push(*(*ufunc).functions.add(i));
                }
            }
            return Ok((native(NativeKind::Ufunc, nonzero(entries)), None));
        }
        if is_ctypes_function(py, &ty) {
            let data = ptr as *const CDataObject;
            let address = if (*data).b_ptr.is_null() { 0 } else { *(*data).b_ptr };
            let declared_name = instance_dict_get(obj, "__name__").and_then(|n| n.extract::<String>().ok());
            return Ok((
                ObjectShape::Native {
                    kind: NativeKind::FfiPointer,
                    entries: nonzero([address]),
                    declared_name,
                },
                None,
            ));
        }
    }

    if is_exact(&ty, &known.function) {
        return Ok((ObjectShape::InterpretedFunction, None));
    }
    let wrapped = if is_exact(&ty, &known.method) {
        Some((WrapperKind::BoundMethod, generic_attr(obj, "__func__")?))
    } else if is_exact(&ty, &known.static_method) {
        Some((WrapperKind::StaticMethod, generic_attr(obj, "__func__")?))
    } else if is_exact(&ty, &known.class_method) {
        Some((WrapperKind::ClassMethod, generic_attr(obj, "__func__")?))
    } else if is_exact(&ty, &known.partial) {
        Some((WrapperKind::Partial, generic_attr(obj, "func")?))
    } else {
        instance_dict_get(obj, "__wrapped__").map(|inner| (WrapperKind::Decorated, inner))
    };
    if let Some((kind, inner)) = wrapped {
        return Ok((ObjectShape::Wrapper { kind, inner: 0 }, Some(inner)));
    }

    let class = ty.into_any();
    // SAFETY: `class` is the live type object of `obj`.
    let call = unsafe { read_word(class.as_ptr(), TP_CALL) };
    if call != 0 {
        return Ok((ObjectShape::CallableInstance { class: 0 }, Some(class)));
    }
    if defined_natively(py, &class) {
        return Ok((ObjectShape::Instance { class: 0 }, Some(class)));
    }
    Ok((ObjectShape::Data, None))
}

impl ObjectModel for LiveRuntime {
    fn import_module(&self, import_name: &str) -> XrayResult<ObjectId> {
        Python::with_gil(|py| {
            let module = py.import(import_name).map_err(introspection)?;
            Ok(self.register(module.as_any()))
        })
    }

    fn shape(&self, id: ObjectId) -> XrayResult<ObjectShape> {
        Python::with_gil(|py| {
            let obj = self.get(py, id)?;
            let (shape, linked) = shape_of(py, &obj).map_err(introspection)?;
            Ok(match (shape, linked) {
                (ObjectShape::Wrapper { kind, .. }, Some(inner)) => ObjectShape::Wrapper {
                    kind,
                    inner: self.register(&inner),
                },
                (ObjectShape::CallableInstance { .. }, Some(class)) => ObjectShape::CallableInstance {
                    class: self.register(&class),
                },
                (ObjectShape::Instance { .. }, Some(class)) => ObjectShape::Instance {
                    class: self.register(&class),
                },
                (shape, _) => shape,
            })
        })
    }

    fn attributes(&self, id: ObjectId) -> XrayResult<Vec<(String, ObjectId)>> {
        Python::with_gil(|py| {
            let obj = self.get(py, id)?;
            let Some(dict) = static_dict(py, &obj).map_err(introspection)? else {
                return Ok(Vec::new());
            };
            let items = dict
                .call_method0("items")
                .and_then(|items| items.try_iter())
                .map_err(introspection)?;
            let mut out = Vec::new();
            for item in items {
                let (name, value): (Bound<'_, PyAny>, Bound<'_, PyAny>) =
                    item.and_then(|i| i.extract()).map_err(introspection)?;
                let Ok(name) = name.extract::<String>() else {
                    continue;
                };
                out.push((name, self.register(&value)));
            }
            debug!(object = id, attributes = out.len(), "attributes read");
            Ok(out)
        })
    }
}

/// Load ranges of the libraries under `root` mapped into this process.
pub fn current_library_ranges(root: &Path) -> XrayResult<std::collections::BTreeMap<String, LoadRange>> {
    let maps = std::fs::read_to_string("/proc/self/maps")?;
    Ok(library_ranges(&parse_proc_maps(&maps), root))
}

#[cfg(all(test, feature = "python"))]
mod tests {
    use pyo3::ffi::c_str;

    use super::*;

    fn namespace<'py>(py: Python<'py>, code: &CStr) -> Bound<'py, PyDict> {
        let ns = PyDict::new(py);
        py.run(code, Some(&ns), None).unwrap();
        ns
    }

    #[test]
    fn lookalike_wrapper_classes_run_no_user_code() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let ns = namespace(
                py,
                c_str!(
                    r#"
touched = []

class partial:
    @property
    def func(self):
        touched.append("func")
        return len

    def __getattr__(self, name):
        touched.append(name)
        return len

class method(partial):
    pass

class cython_function_or_method(partial):
    pass

class method_descriptor(partial):
    pass

fake_partial = partial()
fake_method = method()
fake_cython = cython_function_or_method()
fake_descriptor = method_descriptor()
"#
                ),
            );
            for name in ["fake_partial", "fake_method", "fake_cython", "fake_descriptor"] {
                let obj = ns.get_item(name).unwrap().unwrap();
                let (shape, linked) = shape_of(py, &obj).unwrap();
                assert_eq!(shape, ObjectShape::Data, "{name}");
                assert!(linked.is_none(), "{name}");
            }
            let touched = ns.get_item("touched").unwrap().unwrap();
            assert_eq!(touched.len().unwrap(), 0);
        });
    }

    #[test]
    fn builtin_wrappers_unwrap_to_their_callable() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let ns = namespace(
                py,
                c_str!(
                    r#"
import functools

def target(x, y):
    return x

class Holder:
    def meth(self):
        pass
    sm = staticmethod(target)

real_partial = functools.partial(target, 1)
bound = Holder().meth
static = Holder.__dict__["sm"]
"#
                ),
            );
            let target = ns.get_item("target").unwrap().unwrap();
            let cases = [
                ("real_partial", WrapperKind::Partial),
                ("static", WrapperKind::StaticMethod),
            ];
            for (name, expected) in cases {
                let obj = ns.get_item(name).unwrap().unwrap();
                let (shape, linked) = shape_of(py, &obj).unwrap();
                assert_eq!(shape, ObjectShape::Wrapper { kind: expected, inner: 0 }, "{name}");
                assert!(linked.unwrap().is(&target), "{name}");
            }

            let bound = ns.get_item("bound").unwrap().unwrap();
            let (shape, linked) = shape_of(py, &bound).unwrap();
            assert_eq!(
                shape,
                ObjectShape::Wrapper {
                    kind: WrapperKind::BoundMethod,
                    inner: 0
                }
            );
            let (inner_shape, _) = shape_of(py, &linked.unwrap()).unwrap();
            assert_eq!(inner_shape, ObjectShape::InterpretedFunction);
        });
    }

    #[test]
    fn builtin_function_and_type_expose_entries() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let builtins = py.import("builtins").unwrap();
            let len = builtins.getattr("len").unwrap();
            match shape_of(py, &len).unwrap().0 {
                ObjectShape::Native { kind, entries, .. } => {
                    assert_eq!(kind, NativeKind::BuiltinFunction);
                    assert_eq!(entries.len(), 1);
                }
                other => panic!("unexpected shape {other:?}"),
            }

            let list = builtins.getattr("list").unwrap();
            match shape_of(py, &list).unwrap().0 {
                ObjectShape::Native { kind, entries, .. } => {
                    assert_eq!(kind, NativeKind::Type);
                    assert!(entries.len() > 3);
                }
                other => panic!("unexpected shape {other:?}"),
            }

            let plain = py.eval(c_str!("object()"), None, None).unwrap();
            assert_eq!(shape_of(py, &plain).unwrap().0, ObjectShape::Data);
        });
    }
}
