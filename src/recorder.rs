//! Recorder naming and the source text that declares a recorder.
//!
//! Every probe in a top-level type calls through one recorder reference,
//! the *prefix*. With the field strategy the prefix is a static field on
//! the type itself; with the class strategy it is the `R` field of a nested
//! holder class, which defers recorder creation until the first probe runs.
//! Enums always use the holder form: their constants are constructed before
//! any field of the enum is initialized.

use crate::config::{InstrumentationConfig, RecorderStrategy};

/// Version of the recorder runtime instrumented code links against.
pub const RUNTIME_VERSION: &str = env!("STITCH_RUNTIME_VERSION");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderPrefix {
    /// Name of the recorder field or holder class.
    pub holder: String,
    /// Expression probes call methods on.
    pub access: String,
    pub class_form: bool,
}

impl RecorderPrefix {
    pub fn resolve(config: &InstrumentationConfig, holder: String, is_enum: bool) -> Self {
        let class_form = is_enum || config.strategy == RecorderStrategy::Class;
        let access = if class_form {
            format!("{holder}.R")
        } else {
            holder.clone()
        };
        Self {
            holder,
            access,
            class_form,
        }
    }

    /// Opening of the wrapper call around an expression lambda.
    pub fn lambda_inc(&self) -> String {
        if self.class_form {
            format!("{}.lambdaInc(", self.holder)
        } else {
            format!("{}.lambdaInc(", self.access)
        }
    }
}

/// Identifier for the recorder of the `ordinal`-th top-level type of the
/// `file_index`-th file in a run.
pub fn recorder_name(version: u64, file_index: usize, ordinal: u32, is_enum: bool) -> String {
    let suffix = if is_enum { "_E" } else { "" };
    format!("__STCH{}_{file_index}_{ordinal}{suffix}", to_base36(version))
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Escape `s` for use inside a Java string literal.
pub fn escape_java(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Everything needed to render one recorder declaration.
#[derive(Debug)]
pub struct RecorderSpec<'a> {
    pub prefix: &'a RecorderPrefix,
    pub config: &'a InstrumentationConfig,
    pub version: u64,
    /// One past the highest data index the type's probes may touch.
    pub max_index: u32,
    /// The first recorder in a file also checks the runtime version.
    pub first_in_file: bool,
    /// Enum constants ended without `;`; one must precede the declaration.
    pub enum_terminator: bool,
}

impl RecorderSpec<'_> {
    fn flags(&self) -> u64 {
        u64::from(self.config.flush_policy.ordinal()) | (self.config.flush_interval << 2)
    }

    fn get_recorder(&self) -> String {
        let rt = &self.config.runtime_class;
        format!(
            "{rt}.Stitch.getRecorder(\"{}\",{}L,{}L,{})",
            escape_java(&self.config.init_string()),
            self.version,
            self.flags(),
            self.max_index
        )
    }

    fn version_check(&self) -> String {
        format!(
            "{}.StitchVersionInfo.check(\"{RUNTIME_VERSION}\",{}L)",
            self.config.runtime_class, self.version
        )
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.enum_terminator {
            out.push(';');
        }
        if self.prefix.class_form {
            out.push_str(&self.holder_class());
        } else {
            out.push_str(&self.field());
        }
        out
    }

    fn field(&self) -> String {
        let rt = &self.config.runtime_class;
        let holder = &self.prefix.holder;
        let mut out = String::new();
        if self.first_in_file {
            out.push_str(&format!(
                "public static final boolean {holder}_V={};",
                self.version_check()
            ));
        }
        out.push_str(&format!(
            "public static {rt}.CoverageRecorder {holder}={};",
            self.get_recorder()
        ));
        out
    }

    fn holder_class(&self) -> String {
        let rt = &self.config.runtime_class;
        let jl = &self.config.java_lang_prefix;
        let holder = &self.prefix.holder;
        let check = if self.first_in_file {
            format!("{};", self.version_check())
        } else {
            String::new()
        };
        format!(
            "public static class {holder}{{public static {rt}.CoverageRecorder R;\
             static{{{check}{rt}.CoverageRecorder _R=null;\
             try{{_R={get};}}catch({jl}Throwable t){{_R={rt}.Stitch.getNullRecorder();}}R=_R;}}\
             public static <I,T extends I> I lambdaInc(final int i,final T l,final int si){{\
             {jl}reflect.InvocationHandler h=new {jl}reflect.InvocationHandler(){{\
             public {jl}Object invoke({jl}Object p,{jl}reflect.Method m,{jl}Object[] a) throws {jl}Throwable{{\
             R.inc(i);R.inc(si);try{{return m.invoke(l,a);}}\
             catch({jl}reflect.InvocationTargetException e){{\
             throw e.getCause()!=null?e.getCause():new {jl}RuntimeException(\"Stitch failed to invoke instrumented lambda\",e);}}}}}};\
             @SuppressWarnings(\"unchecked\") I proxy=(I){jl}reflect.Proxy.newProxyInstance(\
             l.getClass().getClassLoader(),l.getClass().getInterfaces(),h);return proxy;}}}}",
            get = self.get_recorder()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base36_names_are_identifiers() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        let name = recorder_name(1_700_000_000_000, 3, 1, true);
        assert!(name.starts_with("__STCH"));
        assert!(name.ends_with("_3_1_E"));
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[test]
    fn field_strategy_prefix() {
        let config = InstrumentationConfig::default();
        let prefix = RecorderPrefix::resolve(&config, "__STCH1_0_0".into(), false);
        assert_eq!(prefix.access, "__STCH1_0_0");
        assert_eq!(prefix.lambda_inc(), "__STCH1_0_0.lambdaInc(");

        let text = RecorderSpec {
            prefix: &prefix,
            config: &config,
            version: 9,
            max_index: 12,
            first_in_file: false,
            enum_terminator: false,
        }
        .render();
        assert_eq!(
            text,
            "public static stitch_runtime.CoverageRecorder __STCH1_0_0=\
             stitch_runtime.Stitch.getRecorder(\".stitch/registry.json\",9L,0L,12);"
        );
    }

    #[test]
    fn enums_always_use_the_holder_form() {
        let config = InstrumentationConfig::default();
        let prefix = RecorderPrefix::resolve(&config, "__STCH1_0_0_E".into(), true);
        assert!(prefix.class_form);
        assert_eq!(prefix.access, "__STCH1_0_0_E.R");
        assert_eq!(prefix.lambda_inc(), "__STCH1_0_0_E.lambdaInc(");

        let text = RecorderSpec {
            prefix: &prefix,
            config: &config,
            version: 9,
            max_index: 4,
            first_in_file: true,
            enum_terminator: true,
        }
        .render();
        assert!(text.starts_with(";public static class __STCH1_0_0_E{"), "got: {text}");
        assert!(text.contains("StitchVersionInfo.check("));
        assert!(text.contains("java.lang.reflect.Proxy.newProxyInstance("));
    }

    #[test]
    fn init_string_is_escaped() {
        assert_eq!(escape_java(r#"C:\tmp\"x""#), r#"C:\\tmp\\\"x\""#);
        assert_eq!(escape_java("a\nb"), "a\\nb");
    }
}
