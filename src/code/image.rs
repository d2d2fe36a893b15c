//! Class images: the unit the loader defines and the rewriter transforms.
//!
//! A class image carries the class header, a pool of method references used by call
//! instructions, and the method definitions with their bodies. Bodies are kept as raw bytes
//! here; [`MethodDef::instructions`] decodes them on demand.

use bitflags::bitflags;

use crate::{
    code::{decode_body, CodeWriter, Instruction, Parser},
    dispatch::MethodSignature,
    runtime::ValueKind,
    Result,
};

/// Magic bytes at the start of every class image.
pub const CLASS_MAGIC: [u8; 4] = *b"SBXC";

/// The only supported image format version.
pub const CLASS_VERSION: u16 = 1;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    /// Class-level flags
    pub struct ClassFlags : u16 {
        /// The class has been processed by the rewriter
        const INSTRUMENTED = 0x0001;
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    /// Method definition flags
    pub struct MethodFlags : u8 {
        /// The method takes no receiver
        const STATIC = 0x01;
        /// The method has no body; it is provided by the platform
        const NATIVE = 0x02;
        /// The method initializes a freshly allocated instance
        const CONSTRUCTOR = 0x04;
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    /// Method reference flags
    pub struct RefFlags : u8 {
        /// The target lives outside the loaded-module space and cannot be redirected
        const INTRINSIC = 0x01;
    }
}

/// A reference to a method, as used by call instructions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodRef {
    /// Fully-qualified name of the declaring class
    pub owner: String,
    /// Method name
    pub name: String,
    /// Parameter shape, receiver excluded
    pub params: Vec<ValueKind>,
    /// Return kind
    pub returns: ValueKind,
    /// Reference flags
    pub flags: RefFlags,
}

impl MethodRef {
    /// The interceptor / dispatch key of this reference.
    #[must_use]
    pub fn signature(&self) -> MethodSignature {
        MethodSignature::new(&self.owner, &self.name, &self.params)
    }

    /// Returns `true` if the target lives outside the loaded-module space.
    #[must_use]
    pub fn is_intrinsic(&self) -> bool {
        self.flags.contains(RefFlags::INTRINSIC)
    }
}

/// A method definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodDef {
    /// Method name
    pub name: String,
    /// Method flags
    pub flags: MethodFlags,
    /// Parameter shape, receiver excluded
    pub params: Vec<ValueKind>,
    /// Return kind
    pub returns: ValueKind,
    /// Number of local slots
    pub locals: u8,
    /// Encoded body; empty for native methods
    pub code: Vec<u8>,
}

impl MethodDef {
    /// Returns `true` if the method takes no receiver.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    /// Returns `true` if the method has no body.
    #[must_use]
    pub fn is_native(&self) -> bool {
        self.flags.contains(MethodFlags::NATIVE)
    }

    /// Returns `true` for constructors.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.flags.contains(MethodFlags::CONSTRUCTOR)
    }

    /// Decodes the body.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] or [`crate::Error::OutOfBounds`] if the body is
    /// damaged.
    pub fn instructions(&self) -> Result<Vec<Instruction>> {
        decode_body(&self.code)
    }
}

/// A decoded class image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassImage {
    /// Class flags
    pub flags: ClassFlags,
    /// Fully-qualified class name
    pub name: String,
    /// Super class, if any
    pub super_name: Option<String>,
    /// Method reference pool
    pub pool: Vec<MethodRef>,
    /// Method definitions
    pub methods: Vec<MethodDef>,
}

impl ClassImage {
    /// Parses a class image.
    ///
    /// Only the container is validated here; bodies are checked when decoded.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for a bad header, unknown value kinds, or
    /// trailing bytes, and [`crate::Error::OutOfBounds`] for truncated input.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut parser = Parser::new(data);

        let magic = parser.read_bytes(CLASS_MAGIC.len())?;
        if magic != CLASS_MAGIC {
            return Err(malformed_error!("Invalid class image magic"));
        }

        let version = parser.read_le::<u16>()?;
        if version != CLASS_VERSION {
            return Err(malformed_error!("Unsupported class image version {}", version));
        }

        let flags = ClassFlags::from_bits(parser.read_le::<u16>()?)
            .ok_or_else(|| malformed_error!("Unknown class flags"))?;
        let name = parser.read_prefixed_str()?.to_string();
        if name.is_empty() {
            return Err(malformed_error!("Class image has an empty name"));
        }
        let super_name = match parser.read_prefixed_str()? {
            "" => None,
            other => Some(other.to_string()),
        };

        let pool_count = parser.read_le::<u16>()?;
        let mut pool = Vec::with_capacity(usize::from(pool_count));
        for _ in 0..pool_count {
            let owner = parser.read_prefixed_str()?.to_string();
            let name = parser.read_prefixed_str()?.to_string();
            let params = read_shape(&mut parser)?;
            let returns = read_kind(&mut parser)?;
            let flags = RefFlags::from_bits(parser.read_le::<u8>()?)
                .ok_or_else(|| malformed_error!("Unknown method reference flags"))?;
            pool.push(MethodRef {
                owner,
                name,
                params,
                returns,
                flags,
            });
        }

        let method_count = parser.read_le::<u16>()?;
        let mut methods = Vec::with_capacity(usize::from(method_count));
        for _ in 0..method_count {
            let name = parser.read_prefixed_str()?.to_string();
            let flags = MethodFlags::from_bits(parser.read_le::<u8>()?)
                .ok_or_else(|| malformed_error!("Unknown method flags on '{}'", name))?;
            let params = read_shape(&mut parser)?;
            let returns = read_kind(&mut parser)?;
            let locals = parser.read_le::<u8>()?;
            let code_len = parser.read_le::<u32>()? as usize;
            let code = parser.read_bytes(code_len)?.to_vec();
            methods.push(MethodDef {
                name,
                flags,
                params,
                returns,
                locals,
                code,
            });
        }

        if parser.has_more_data() {
            return Err(malformed_error!(
                "{} trailing bytes after class image",
                parser.len() - parser.pos()
            ));
        }

        Ok(ClassImage {
            flags,
            name,
            super_name,
            pool,
            methods,
        })
    }

    /// Encodes the image.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a count or string does not fit its field.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = CodeWriter::new();
        writer.write_bytes(&CLASS_MAGIC);
        writer.write_le(CLASS_VERSION);
        writer.write_le(self.flags.bits());
        writer.write_prefixed_str(&self.name)?;
        writer.write_prefixed_str(self.super_name.as_deref().unwrap_or(""))?;

        writer.write_le(count_u16(self.pool.len(), "method references")?);
        for entry in &self.pool {
            writer.write_prefixed_str(&entry.owner)?;
            writer.write_prefixed_str(&entry.name)?;
            write_shape(&mut writer, &entry.params)?;
            writer.write_le(entry.returns as u8);
            writer.write_le(entry.flags.bits());
        }

        writer.write_le(count_u16(self.methods.len(), "methods")?);
        for method in &self.methods {
            writer.write_prefixed_str(&method.name)?;
            writer.write_le(method.flags.bits());
            write_shape(&mut writer, &method.params)?;
            writer.write_le(method.returns as u8);
            writer.write_le(method.locals);
            let code_len = u32::try_from(method.code.len())
                .map_err(|_| malformed_error!("Body of '{}' is too large", method.name))?;
            writer.write_le(code_len);
            writer.write_bytes(&method.code);
        }

        Ok(writer.into_bytes())
    }

    /// Returns `true` if the rewriter has already processed this class.
    #[must_use]
    pub fn is_instrumented(&self) -> bool {
        self.flags.contains(ClassFlags::INSTRUMENTED)
    }

    /// Finds a method by name and parameter shape.
    #[must_use]
    pub fn method(&self, name: &str, params: &[ValueKind]) -> Option<&MethodDef> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.params == params)
    }
}

fn read_kind(parser: &mut Parser<'_>) -> Result<ValueKind> {
    let tag = parser.read_le::<u8>()?;
    ValueKind::from_repr(tag).ok_or_else(|| malformed_error!("Unknown value kind {}", tag))
}

fn read_shape(parser: &mut Parser<'_>) -> Result<Vec<ValueKind>> {
    let count = parser.read_le::<u8>()?;
    (0..count).map(|_| read_kind(parser)).collect()
}

fn write_shape(writer: &mut CodeWriter, params: &[ValueKind]) -> Result<()> {
    let count =
        u8::try_from(params.len()).map_err(|_| malformed_error!("Too many parameters"))?;
    writer.write_le(count);
    for kind in params {
        writer.write_le(*kind as u8);
    }
    Ok(())
}

fn count_u16(len: usize, what: &str) -> Result<u16> {
    u16::try_from(len).map_err(|_| malformed_error!("Too many {}: {}", what, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test::counter_class, Error};

    #[test]
    fn parse_fixture() {
        let bytes = counter_class("app.Counter");
        let image = ClassImage::parse(&bytes).unwrap();
        assert_eq!(image.name, "app.Counter");
        assert!(!image.is_instrumented());
        assert!(image.method("increment", &[ValueKind::Int]).is_some());
        assert!(image.method("increment", &[]).is_none());
        assert_eq!(image.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn bad_magic() {
        let mut bytes = counter_class("app.Counter");
        bytes[0] = b'X';
        assert!(matches!(
            ClassImage::parse(&bytes),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = counter_class("app.Counter");
        bytes.push(0);
        assert!(matches!(
            ClassImage::parse(&bytes),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn truncated_image() {
        let bytes = counter_class("app.Counter");
        assert!(ClassImage::parse(&bytes[..bytes.len() - 1]).is_err());
    }
}
