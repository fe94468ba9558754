//! Text serialization of compiled modules (`GSBC1`)
//!
//! Line one is the literal header `GSBC1`; after that the module sections
//! follow as integer-prefixed lists: constants, strings, functions,
//! classes, globals. The format is whitespace-insensitive on read, so
//! `deserialize(serialize(m)) == m` for any compiler-produced module.

use std::fmt::Write as _;

use super::{
    estimate_stack_slots, ClassAttribute, ClassBytecode, ClassMethod, CompiledModule,
    FunctionBytecode, GlobalBinding, Instruction, OpCode, Value,
};

/// Malformed bytecode text.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("Invalid bytecode header")]
    InvalidHeader,
    #[error("Unexpected end of bytecode text")]
    UnexpectedEof,
    #[error("Invalid number in bytecode text: {0}")]
    BadNumber(String),
    #[error("Unterminated quoted string in bytecode text")]
    UnterminatedString,
    #[error("Unknown opcode byte: {0}")]
    BadOpcode(u8),
    #[error("Unknown value tag: {0}")]
    BadValueTag(u8),
}

fn quote(out: &mut String, text: &str) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            _ => out.push(ch),
        }
    }
    out.push('"');
}

/// Render a module in the GSBC1 text form.
pub fn serialize_module_text(module: &CompiledModule) -> String {
    let mut out = String::new();
    out.push_str("GSBC1\n");

    let _ = writeln!(out, "{}", module.constants.len());
    for constant in &module.constants {
        let _ = writeln!(out, "{} {}", constant.tag(), constant.payload());
    }

    let _ = writeln!(out, "{}", module.strings.len());
    for s in &module.strings {
        quote(&mut out, s);
        out.push('\n');
    }

    let _ = writeln!(out, "{}", module.functions.len());
    for function in &module.functions {
        quote(&mut out, &function.name);
        out.push('\n');
        let _ = writeln!(out, "{}", function.params.len());
        for param in &function.params {
            quote(&mut out, param);
            out.push('\n');
        }
        let _ = writeln!(out, "{}", function.local_count);
        let _ = writeln!(out, "{}", function.code.len());
        for ins in &function.code {
            let _ = writeln!(out, "{} {} {}", ins.op as u8, ins.a, ins.b);
        }
    }

    let _ = writeln!(out, "{}", module.classes.len());
    for class in &module.classes {
        quote(&mut out, &class.name);
        out.push('\n');
        let _ = writeln!(out, "{}", class.base_class_index);
        let _ = writeln!(out, "{}", class.attributes.len());
        for attr in &class.attributes {
            quote(&mut out, &attr.name);
            let _ = writeln!(
                out,
                " {} {}",
                attr.default_value.tag(),
                attr.default_value.payload()
            );
        }
        let _ = writeln!(out, "{}", class.methods.len());
        for method in &class.methods {
            quote(&mut out, &method.name);
            let _ = writeln!(out, " {}", method.function_index);
        }
    }

    let _ = writeln!(out, "{}", module.globals.len());
    for global in &module.globals {
        quote(&mut out, &global.name);
        let _ = writeln!(
            out,
            " {} {}",
            global.initial_value.tag(),
            global.initial_value.payload()
        );
    }

    out
}

/// Whitespace-driven scanner over the serialized text.
struct Scanner<'a> {
    bytes: &'a [u8],
    index: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            bytes: text.as_bytes(),
            index: 0,
        }
    }

    fn skip_whitespace(&mut self) {
        while self.index < self.bytes.len() && self.bytes[self.index].is_ascii_whitespace() {
            self.index += 1;
        }
    }

    fn word(&mut self) -> Result<&'a str, FormatError> {
        self.skip_whitespace();
        if self.index >= self.bytes.len() {
            return Err(FormatError::UnexpectedEof);
        }
        let start = self.index;
        while self.index < self.bytes.len() && !self.bytes[self.index].is_ascii_whitespace() {
            self.index += 1;
        }
        Ok(std::str::from_utf8(&self.bytes[start..self.index]).expect("input is valid UTF-8"))
    }

    fn int(&mut self) -> Result<i64, FormatError> {
        let word = self.word()?;
        word.parse::<i64>()
            .map_err(|_| FormatError::BadNumber(word.to_string()))
    }

    fn count(&mut self) -> Result<usize, FormatError> {
        let value = self.int()?;
        if value < 0 {
            return Err(FormatError::BadNumber(value.to_string()));
        }
        Ok(value as usize)
    }

    fn quoted(&mut self) -> Result<String, FormatError> {
        self.skip_whitespace();
        if self.index >= self.bytes.len() || self.bytes[self.index] != b'"' {
            return Err(FormatError::UnterminatedString);
        }
        self.index += 1;
        let mut out = String::new();
        loop {
            if self.index >= self.bytes.len() {
                return Err(FormatError::UnterminatedString);
            }
            match self.bytes[self.index] {
                b'"' => {
                    self.index += 1;
                    return Ok(out);
                }
                b'\\' => {
                    self.index += 1;
                    if self.index >= self.bytes.len() {
                        return Err(FormatError::UnterminatedString);
                    }
                    out.push(self.bytes[self.index] as char);
                    self.index += 1;
                }
                _ => {
                    // Re-assemble multi-byte UTF-8 sequences byte by byte.
                    let start = self.index;
                    self.index += 1;
                    while self.index < self.bytes.len() && self.bytes[self.index] & 0xC0 == 0x80 {
                        self.index += 1;
                    }
                    out.push_str(
                        std::str::from_utf8(&self.bytes[start..self.index])
                            .expect("input is valid UTF-8"),
                    );
                }
            }
        }
    }

    fn value(&mut self) -> Result<Value, FormatError> {
        let tag = self.int()?;
        let payload = self.int()?;
        if !(0..=255).contains(&tag) {
            return Err(FormatError::BadValueTag(tag.clamp(0, 255) as u8));
        }
        Value::from_tag(tag as u8, payload).ok_or(FormatError::BadValueTag(tag as u8))
    }
}

/// Parse GSBC1 text back into a module. The operand-stack estimate is
/// recomputed from the instructions, so it never appears in the text.
pub fn deserialize_module_text(text: &str) -> Result<CompiledModule, FormatError> {
    let mut lines = text.splitn(2, '\n');
    let header = lines.next().unwrap_or_default().trim_end_matches('\r');
    if header != "GSBC1" {
        return Err(FormatError::InvalidHeader);
    }
    let body = lines.next().ok_or(FormatError::UnexpectedEof)?;
    let mut scanner = Scanner::new(body);

    let mut module = CompiledModule::default();

    let constant_count = scanner.count()?;
    module.constants.reserve(constant_count);
    for _ in 0..constant_count {
        module.constants.push(scanner.value()?);
    }

    let string_count = scanner.count()?;
    module.strings.reserve(string_count);
    for _ in 0..string_count {
        module.strings.push(scanner.quoted()?);
    }

    let function_count = scanner.count()?;
    module.functions.reserve(function_count);
    for _ in 0..function_count {
        let mut function = FunctionBytecode {
            name: scanner.quoted()?,
            ..Default::default()
        };
        let param_count = scanner.count()?;
        function.params.reserve(param_count);
        for _ in 0..param_count {
            function.params.push(scanner.quoted()?);
        }
        function.local_count = scanner.count()?;
        let code_count = scanner.count()?;
        function.code.reserve(code_count);
        for _ in 0..code_count {
            let op_byte = scanner.int()?;
            let op = OpCode::from_u8(op_byte.clamp(0, 255) as u8)
                .ok_or(FormatError::BadOpcode(op_byte.clamp(0, 255) as u8))?;
            let a = scanner.int()? as i32;
            let b = scanner.int()? as i32;
            function.code.push(Instruction::new(op, a, b));
        }
        function.stack_slot_count = estimate_stack_slots(&function.code);
        module.functions.push(function);
    }

    let class_count = scanner.count()?;
    module.classes.reserve(class_count);
    for _ in 0..class_count {
        let mut class = ClassBytecode {
            name: scanner.quoted()?,
            ..Default::default()
        };
        class.base_class_index = scanner.int()? as i32;
        let attr_count = scanner.count()?;
        class.attributes.reserve(attr_count);
        for _ in 0..attr_count {
            let name = scanner.quoted()?;
            let default_value = scanner.value()?;
            class.attributes.push(ClassAttribute {
                name,
                default_value,
            });
        }
        let method_count = scanner.count()?;
        class.methods.reserve(method_count);
        for _ in 0..method_count {
            let name = scanner.quoted()?;
            let function_index = scanner.count()?;
            class.methods.push(ClassMethod {
                name,
                function_index,
            });
        }
        module.classes.push(class);
    }

    let global_count = scanner.count()?;
    module.globals.reserve(global_count);
    for _ in 0..global_count {
        let name = scanner.quoted()?;
        let initial_value = scanner.value()?;
        module.globals.push(GlobalBinding {
            name,
            initial_value,
        });
    }

    Ok(module)
}
