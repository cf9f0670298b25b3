//! WGSL emission for kernel programs.
//!
//! Every binding is an `array<u32>`: 4-byte element types are reinterpreted with `bitcast`, and
//! [`DataType::Bool`] is widened to one `u32` per element.

use std::fmt::Write;

use crate::loom::{
    device::DeviceError,
    kernel::{self, Expr, IndexOp, KernelProgram},
    num::DataType,
};

/// Workgroup counts of one launch, and the number of invocations covered by one row of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub groups: [u32; 3],
    pub stride: u32,
}

impl Dispatch {
    /// Covers `count` elements with workgroups of `workgroup_size`, folding into the second
    /// dimension once `max` workgroups per dimension are exceeded.
    pub fn new(count: usize, workgroup_size: u32, max: u32) -> Result<Self, DeviceError> {
        let overflow = || DeviceError::Unsupported(format!("dispatch of {count} elements"));
        let count = u32::try_from(count).map_err(|_| overflow())?;
        let groups = count.div_ceil(workgroup_size);
        if groups <= max {
            let stride = groups.max(1) * workgroup_size;
            return Ok(Self {
                groups: [groups, 1, 1],
                stride,
            });
        }

        let rows = groups.div_ceil(max);
        if rows > max {
            return Err(overflow());
        }
        Ok(Self {
            groups: [max, rows, 1],
            stride: max * workgroup_size,
        })
    }
}

/// Returns `true` if the device can store elements of the type.
#[inline]
pub fn is_supported(r#type: DataType) -> bool {
    matches!(
        r#type,
        DataType::Bool | DataType::U32 | DataType::I32 | DataType::F32
    )
}

#[inline]
fn literal(value: usize) -> Result<String, DeviceError> {
    match u32::try_from(value) {
        Ok(value) => Ok(format!("{value}u")),
        Err(_) => Err(DeviceError::Unsupported(format!("index {value}"))),
    }
}

/// Emits the WGSL source of a checked program.
pub fn emit(
    program: &KernelProgram,
    workgroup_size: u32,
    dispatch: Dispatch,
) -> Result<String, DeviceError> {
    if let Some(r#type) = program
        .inputs
        .iter()
        .map(|input| input.r#type)
        .chain(Some(program.output.r#type))
        .find(|&r#type| !is_supported(r#type))
    {
        return Err(DeviceError::Unsupported(format!("data type {}", r#type)));
    }

    let mut source = String::new();
    let mut header = || -> Result<(), std::fmt::Error> {
        writeln!(source, "// {program}")?;
        for (index, input) in program.inputs.iter().enumerate() {
            writeln!(
                source,
                "@group(0) @binding({index}) var<storage, read> input_{index}: array<u32>; // {}",
                input.name
            )?;
        }
        writeln!(
            source,
            "@group(0) @binding({}) var<storage, read_write> output: array<u32>;",
            program.inputs.len()
        )?;
        writeln!(source)?;
        writeln!(source, "@compute @workgroup_size({workgroup_size}, 1, 1)")?;
        writeln!(
            source,
            "fn main(@builtin(global_invocation_id) invocation: vec3<u32>) {{"
        )?;
        Ok(())
    };
    header().map_err(|err| DeviceError::Shader(err.to_string()))?;

    let dims = &program.output.dims;
    let mut lines = vec![
        format!(
            "let element = invocation.y * {}u + invocation.x;",
            dispatch.stride
        ),
        format!(
            "if element >= {} {{ return; }}",
            literal(program.output.count())?
        ),
    ];
    if !dims.is_empty() {
        lines.push("var rest = element;".into());
    }
    for (axis, &dim) in dims.iter().enumerate().rev() {
        let dim = literal(dim)?;
        lines.push(format!("var i{axis} = rest % {dim};"));
        lines.push(format!("rest = rest / {dim};"));
    }
    for op in &program.body.remap {
        match *op {
            IndexOp::Reset { axis } => lines.push(format!("i{axis} = 0u;")),
            IndexOp::Offset { axis, offset } => {
                lines.push(format!("i{axis} = i{axis} + {};", literal(offset)?))
            }
            IndexOp::Reverse { axis: _, len: 0 } => {}
            IndexOp::Reverse { axis, len } => {
                lines.push(format!("i{axis} = {} - i{axis};", literal(len - 1)?))
            }
        }
    }
    let value = expr(program, &program.body.value)?;
    lines.push(format!("output[element] = {value};"));

    for line in lines {
        source.push_str("    ");
        source.push_str(&line);
        source.push('\n');
    }
    source.push_str("}\n");
    Ok(source)
}

/// Physical index into an input, aligning the output multi-index from the right.
fn offset(program: &KernelProgram, input: usize) -> Result<String, DeviceError> {
    let rank = program.output.dims.len();
    let dims = &program.inputs[input].dims;
    let strides = kernel::strides(dims);
    let mut terms = vec![];
    for (axis, stride) in strides.into_iter().enumerate() {
        if let Some(axis) = (rank + axis).checked_sub(dims.len()) {
            terms.push(format!("i{axis} * {}", literal(stride)?));
        }
    }
    match terms.is_empty() {
        true => Ok("0u".into()),
        false => Ok(terms.join(" + ")),
    }
}

fn expr(program: &KernelProgram, value: &Expr) -> Result<String, DeviceError> {
    match value {
        Expr::Read(input) => Ok(format!("input_{input}[{}]", offset(program, *input)?)),
        Expr::Select { cond, x, y } => {
            let cond = expr(program, cond)?;
            let x = expr(program, x)?;
            let y = expr(program, y)?;
            Ok(format!("select({y}, {x}, {cond} != 0u)"))
        }
        Expr::Logical(x) => {
            let r#type = program.type_of(x)?;
            let x = expr(program, x)?;
            let test = match r#type {
                DataType::F32 => format!("bitcast<f32>({x}) > 0.0"),
                DataType::I32 => format!("bitcast<i32>({x}) > 0i"),
                DataType::U32 | DataType::Bool => format!("{x} > 0u"),
                r#type => return Err(DeviceError::Unsupported(format!("data type {}", r#type))),
            };
            Ok(format!("select(0u, 1u, {test})"))
        }
    }
}

/// Parses and validates WGSL source before it is handed to the driver.
pub fn validate(source: &str) -> Result<naga::Module, DeviceError> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|err| DeviceError::Shader(err.emit_to_string(source)))?;
    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::empty(),
    );
    validator
        .validate(&module)
        .map_err(|err| DeviceError::Shader(err.into_inner().to_string()))?;
    Ok(module)
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Dispatch, emit, validate};
    use crate::loom::{
        device::DeviceError,
        kernel::{Expr, IndexOp, KernelBody, KernelInput, KernelOutput, KernelProgram},
        num::DataType,
    };

    #[test]
    fn test_dispatch() -> Result<(), Box<dyn Error>> {
        let dispatch = Dispatch::new(100, 64, 65535)?;
        assert_eq!(dispatch.groups, [2, 1, 1]);
        assert_eq!(dispatch.stride, 128);

        let dispatch = Dispatch::new(0, 64, 65535)?;
        assert_eq!(dispatch.groups, [0, 1, 1]);

        let dispatch = Dispatch::new(64 * 10, 64, 4)?;
        assert_eq!(dispatch.groups, [4, 3, 1]);
        assert_eq!(dispatch.stride, 256);

        assert!(matches!(
            Dispatch::new(64 * 17, 64, 4),
            Err(DeviceError::Unsupported(_))
        ));
        Ok(())
    }

    #[test]
    fn test_emit_broadcast() -> Result<(), Box<dyn Error>> {
        let program = KernelProgram {
            name: "Expand".into(),
            inputs: vec![KernelInput::indexed("X", [3, 1], DataType::F32)],
            output: KernelOutput {
                dims: [2, 3, 4].into(),
                r#type: DataType::F32,
            },
            body: KernelBody {
                remap: vec![IndexOp::Reset { axis: 2 }],
                value: Expr::Read(0),
            },
        };
        let dispatch = Dispatch::new(program.output.count(), 64, 65535)?;
        let source = emit(&program, 64, dispatch)?;
        assert!(source.contains("i2 = 0u;"));
        assert!(source.contains("output[element] = input_0[i1 * 1u + i2 * 1u];"));
        validate(&source)?;
        Ok(())
    }

    #[test]
    fn test_emit_select() -> Result<(), Box<dyn Error>> {
        let program = KernelProgram {
            name: "Where".into(),
            inputs: vec![
                KernelInput::logical("C", [4]),
                KernelInput::indexed("X", [4], DataType::I32),
                KernelInput::indexed("Y", [0usize; 0], DataType::I32),
            ],
            output: KernelOutput {
                dims: [4].into(),
                r#type: DataType::I32,
            },
            body: KernelBody {
                remap: vec![IndexOp::Reverse { axis: 0, len: 4 }],
                value: Expr::select(Expr::Read(0), Expr::Read(1), Expr::Read(2)),
            },
        };
        let dispatch = Dispatch::new(program.output.count(), 64, 65535)?;
        let source = emit(&program, 64, dispatch)?;
        assert!(source.contains("i0 = 3u - i0;"));
        assert!(source.contains("select(input_2[0u], input_1[i0 * 1u], input_0[i0 * 1u] != 0u)"));
        validate(&source)?;
        Ok(())
    }

    #[test]
    fn test_emit_logical() -> Result<(), Box<dyn Error>> {
        for r#type in [DataType::F32, DataType::I32, DataType::U32] {
            let program = KernelProgram {
                name: "Logical".into(),
                inputs: vec![KernelInput::indexed("X", [5], r#type)],
                output: KernelOutput {
                    dims: [5].into(),
                    r#type: DataType::Bool,
                },
                body: KernelBody {
                    remap: vec![],
                    value: Expr::Logical(Box::new(Expr::Read(0))),
                },
            };
            let dispatch = Dispatch::new(program.output.count(), 64, 65535)?;
            validate(&emit(&program, 64, dispatch)?)?;
        }
        Ok(())
    }

    #[test]
    fn test_emit_unsupported() {
        let program = KernelProgram {
            name: "Copy".into(),
            inputs: vec![KernelInput::indexed("X", [5], DataType::F16)],
            output: KernelOutput {
                dims: [5].into(),
                r#type: DataType::F16,
            },
            body: KernelBody {
                remap: vec![],
                value: Expr::Read(0),
            },
        };
        let dispatch = Dispatch {
            groups: [1, 1, 1],
            stride: 64,
        };
        assert!(matches!(
            emit(&program, 64, dispatch),
            Err(DeviceError::Unsupported(_))
        ));
    }

    #[test]
    fn test_validate_rejects() {
        assert!(matches!(
            validate("fn main() { let x: u32 = 1.0; }"),
            Err(DeviceError::Shader(_))
        ));
    }
}
