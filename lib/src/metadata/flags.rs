use bitflags::bitflags;

bitflags! {
    /// Attributes on type definitions
    ///
    /// [0]: ECMA-335, Partition II, 23.1.15
    pub struct TypeAttributes: u32 {
        const PUBLIC = 0x0000_0001;
        const NESTED_PUBLIC = 0x0000_0002;
        const NESTED_PRIVATE = 0x0000_0003;
        const NESTED_FAMILY = 0x0000_0004;
        const NESTED_ASSEMBLY = 0x0000_0005;
        const NESTED_FAM_AND_ASSEM = 0x0000_0006;
        const NESTED_FAM_OR_ASSEM = 0x0000_0007;
        const SEQUENTIAL_LAYOUT = 0x0000_0008;
        const EXPLICIT_LAYOUT = 0x0000_0010;
        const INTERFACE = 0x0000_0020;
        const ABSTRACT = 0x0000_0080;
        const SEALED = 0x0000_0100;
        const SPECIAL_NAME = 0x0000_0400;
        const RT_SPECIAL_NAME = 0x0000_0800;
        const IMPORT = 0x0000_1000;
        const SERIALIZABLE = 0x0000_2000;
        const WINDOWS_RUNTIME = 0x0000_4000;
        const UNICODE_CLASS = 0x0001_0000;
        const AUTO_CLASS = 0x0002_0000;
        const HAS_SECURITY = 0x0004_0000;
        const BEFORE_FIELD_INIT = 0x0010_0000;
        const CUSTOM_FORMAT = 0x00C0_0000;
    }
}

bitflags! {
    /// Attributes on method definitions
    ///
    /// The low three bits are an access enumeration rather than independent flags.
    ///
    /// [0]: ECMA-335, Partition II, 23.1.10
    pub struct MethodAttributes: u16 {
        const PRIVATE = 0x0001;
        const FAM_AND_ASSEM = 0x0002;
        const ASSEMBLY = 0x0003;
        const FAMILY = 0x0004;
        const FAM_OR_ASSEM = 0x0005;
        const PUBLIC = 0x0006;
        const UNMANAGED_EXPORT = 0x0008;
        const STATIC = 0x0010;
        const FINAL = 0x0020;
        const VIRTUAL = 0x0040;
        const HIDE_BY_SIG = 0x0080;
        const NEW_SLOT = 0x0100;
        const STRICT = 0x0200;
        const ABSTRACT = 0x0400;
        const SPECIAL_NAME = 0x0800;
        const RT_SPECIAL_NAME = 0x1000;
        const PINVOKE_IMPL = 0x2000;
        const HAS_SECURITY = 0x4000;
        const REQUIRE_SEC_OBJECT = 0x8000;
    }
}

bitflags! {
    /// Implementation attributes on method definitions
    ///
    /// [0]: ECMA-335, Partition II, 23.1.11
    pub struct MethodImplAttributes: u16 {
        const NATIVE = 0x0001;
        const OPTIL = 0x0002;
        const RUNTIME = 0x0003;
        const UNMANAGED = 0x0004;
        const NO_INLINING = 0x0008;
        const FORWARD_REF = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const NO_OPTIMIZATION = 0x0040;
        const PRESERVE_SIG = 0x0080;
        const AGGRESSIVE_INLINING = 0x0100;
        const AGGRESSIVE_OPTIMIZATION = 0x0200;
        const INTERNAL_CALL = 0x1000;
    }
}

impl MethodImplAttributes {
    /// Is the implementation plain IL (as opposed to native, OPTIL, or runtime-provided)?
    pub fn is_il(&self) -> bool {
        self.bits() & Self::RUNTIME.bits() == 0
    }
}
