use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::config::Configuration;
use crate::scan::{DriverReport, instrument_directory};

/// Source file definition for compilation.
pub(crate) struct SourceFile {
    pub(crate) path: String,
    pub(crate) contents: String,
}

impl SourceFile {
    pub(crate) fn new(path: &str, contents: &str) -> Self {
        Self {
            path: path.to_string(),
            contents: contents.to_string(),
        }
    }
}

/// Compiled output directories from the harness.
pub(crate) struct CompileOutput {
    _temp_dir: TempDir,
    classes_dir: PathBuf,
}

impl CompileOutput {
    pub(crate) fn classes_dir(&self) -> &Path {
        &self.classes_dir
    }
}

/// Test harness that compiles Java sources, instruments them and runs them on a JVM.
pub(crate) struct JvmTestHarness {
    javac: PathBuf,
    java: PathBuf,
}

impl JvmTestHarness {
    /// Returns `None` when no JDK is configured through `JAVA_HOME`.
    pub(crate) fn from_env() -> Option<Self> {
        let home = PathBuf::from(std::env::var_os("JAVA_HOME")?);
        let javac = jdk_tool(&home, "javac")?;
        let java = jdk_tool(&home, "java")?;
        Some(Self { javac, java })
    }

    pub(crate) fn compile(&self, sources: &[SourceFile]) -> Result<CompileOutput> {
        let temp_dir = tempfile::tempdir().context("create temp dir")?;
        let src_dir = temp_dir.path().join("src");
        let classes_dir = temp_dir.path().join("classes");
        fs::create_dir_all(&src_dir).context("create src dir")?;
        fs::create_dir_all(&classes_dir).context("create classes dir")?;

        let mut source_paths = Vec::new();
        for source in sources {
            let path = src_dir.join(&source.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("create source parent dir")?;
            }
            fs::write(&path, source.contents.as_bytes()).context("write source file")?;
            source_paths.push(path);
        }

        let mut command = Command::new(&self.javac);
        command.arg("-g").arg("-d").arg(&classes_dir);
        command.args(&source_paths);
        run_command(command, "javac")?;

        Ok(CompileOutput {
            _temp_dir: temp_dir,
            classes_dir,
        })
    }

    pub(crate) fn instrument(
        &self,
        classes_dir: &Path,
        config: &Configuration,
    ) -> Result<DriverReport> {
        instrument_directory(classes_dir, config, None).context("instrument classes")
    }

    /// Run `main_class` with the verifier enabled and return its standard output.
    pub(crate) fn run(&self, classes_dir: &Path, main_class: &str) -> Result<String> {
        let mut command = Command::new(&self.java);
        command
            .arg("-Xverify:all")
            .arg("-cp")
            .arg(classes_dir)
            .arg(main_class);
        let output = run_command(command, "java")?;
        Ok(String::from_utf8_lossy(&output).to_string())
    }
}

fn jdk_tool(home: &Path, name: &str) -> Option<PathBuf> {
    let mut path = home.join("bin").join(name);
    if cfg!(windows) {
        path.set_extension("exe");
    }
    path.exists().then_some(path)
}

fn run_command(mut command: Command, label: &str) -> Result<Vec<u8>> {
    let output = command.output().with_context(|| format!("run {label}"))?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{label} failed: stdout={stdout} stderr={stderr}");
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    const NOT_NULL_SOURCE: &str = r#"
package org.jetbrains.annotations;

import java.lang.annotation.*;

@Retention(RetentionPolicy.CLASS)
@Target({ElementType.METHOD, ElementType.PARAMETER})
public @interface NotNull {}
"#;

    fn harness() -> Option<JvmTestHarness> {
        let harness = JvmTestHarness::from_env();
        if harness.is_none() {
            eprintln!("JAVA_HOME not set; skipping JVM test");
        }
        harness
    }

    fn implicit() -> Configuration {
        Settings {
            implicit: true,
            ..Settings::default()
        }
        .resolve()
        .expect("config")
    }

    #[test]
    fn annotated_parameters_and_returns_throw_on_null() {
        let Some(harness) = harness() else {
            return;
        };
        let sources = [
            SourceFile::new("org/jetbrains/annotations/NotNull.java", NOT_NULL_SOURCE),
            SourceFile::new(
                "demo/Greeter.java",
                r#"
package demo;

import org.jetbrains.annotations.NotNull;

public class Greeter {
    public String greet(@NotNull String name) {
        return "hi " + name;
    }

    @NotNull
    public String pick(boolean flag) {
        return flag ? "x" : null;
    }
}
"#,
            ),
            SourceFile::new(
                "demo/Main.java",
                r#"
package demo;

public class Main {
    public static void main(String[] args) {
        Greeter greeter = new Greeter();
        System.out.println(greeter.greet("bob"));
        try {
            greeter.greet(null);
        } catch (IllegalArgumentException e) {
            System.out.println(e.getMessage());
        }
        System.out.println(greeter.pick(true));
        try {
            greeter.pick(false);
        } catch (IllegalStateException e) {
            System.out.println(e.getMessage());
        }
    }
}
"#,
            ),
        ];
        let output = harness.compile(&sources).expect("compile");

        let report = harness
            .instrument(output.classes_dir(), &Configuration::default())
            .expect("instrument");
        let stdout = harness.run(output.classes_dir(), "demo.Main").expect("run");

        assert_eq!(report.modified, 1);
        assert_eq!(
            stdout.lines().collect::<Vec<_>>(),
            vec![
                "hi bob",
                "Argument 0 for @NotNull parameter of demo/Greeter.greet must not be null",
                "x",
                "NotNull method demo/Greeter.pick must not return null",
            ]
        );
    }

    #[test]
    fn bridge_dispatch_reports_the_specialized_method_once() {
        let Some(harness) = harness() else {
            return;
        };
        let sources = [
            SourceFile::new(
                "demo/Source.java",
                r#"
package demo;

public interface Source<T> {
    T get(T fallback);
}
"#,
            ),
            SourceFile::new(
                "demo/Main.java",
                r#"
package demo;

public class Main implements Source<String> {
    public String get(String fallback) {
        return fallback;
    }

    public static void main(String[] args) {
        Source<String> source = new Main();
        Runnable anonymous = new Runnable() {
            public void run() {}
        };
        anonymous.run();
        try {
            source.get(null);
        } catch (IllegalArgumentException e) {
            System.out.println(e.getMessage());
        }
    }
}
"#,
            ),
        ];
        let output = harness.compile(&sources).expect("compile");

        harness
            .instrument(output.classes_dir(), &implicit())
            .expect("instrument");
        let stdout = harness.run(output.classes_dir(), "demo.Main").expect("run");

        assert_eq!(
            stdout.lines().collect::<Vec<_>>(),
            vec!["Argument 0 for implicit 'NotNull' parameter of demo/Main.get must not be null"]
        );
    }

    #[test]
    fn annotated_local_class_checks_the_declared_parameter() {
        let Some(harness) = harness() else {
            return;
        };
        let sources = [
            SourceFile::new("org/jetbrains/annotations/NotNull.java", NOT_NULL_SOURCE),
            SourceFile::new(
                "demo/Main.java",
                r#"
package demo;

import org.jetbrains.annotations.NotNull;

public class Main {
    String make(String name, String captured) {
        class L {
            final String value;

            L(@NotNull String name) {
                value = name + captured;
            }
        }
        return new L(name).value;
    }

    public static void main(String[] args) {
        Main main = new Main();
        System.out.println(main.make("a", "b"));
        System.out.println(main.make("c", null));
        try {
            main.make(null, "x");
        } catch (IllegalArgumentException e) {
            System.out.println(e.getMessage());
        }
    }
}
"#,
            ),
        ];
        let output = harness.compile(&sources).expect("compile");

        harness
            .instrument(output.classes_dir(), &Configuration::default())
            .expect("instrument");
        let stdout = harness.run(output.classes_dir(), "demo.Main").expect("run");

        assert_eq!(
            stdout.lines().collect::<Vec<_>>(),
            vec![
                "ab",
                "cnull",
                "Argument 0 for @NotNull parameter of demo/Main$1L.<init> must not be null",
            ]
        );
    }

    #[test]
    fn implicit_local_class_leaves_captured_values_alone() {
        let Some(harness) = harness() else {
            return;
        };
        let sources = [SourceFile::new(
            "demo/Main.java",
            r#"
package demo;

public class Main {
    String make(boolean nullName, boolean capture) {
        String captured = capture ? "x" : null;
        class L {
            final String value;

            L(String name) {
                value = name + captured;
            }
        }
        return new L(nullName ? null : "c").value;
    }

    public static void main(String[] args) {
        Main main = new Main();
        System.out.println(main.make(false, false));
        try {
            main.make(true, true);
        } catch (IllegalArgumentException e) {
            System.out.println(e.getMessage());
        }
    }
}
"#,
        )];
        let output = harness.compile(&sources).expect("compile");

        harness
            .instrument(output.classes_dir(), &implicit())
            .expect("instrument");
        let stdout = harness.run(output.classes_dir(), "demo.Main").expect("run");

        assert_eq!(
            stdout.lines().collect::<Vec<_>>(),
            vec![
                "cnull",
                "Argument 0 for implicit 'NotNull' parameter of demo/Main$1L.<init> must not be null",
            ]
        );
    }

    #[test]
    fn anonymous_subclass_reports_the_super_constructor() {
        let Some(harness) = harness() else {
            return;
        };
        let sources = [SourceFile::new(
            "demo/Main.java",
            r#"
package demo;

public class Main {
    static class Foo {
        Foo(String value) {}
    }

    public static void main(String[] args) {
        try {
            new Foo(null) {};
        } catch (IllegalArgumentException e) {
            System.out.println(e.getMessage());
        }
    }
}
"#,
        )];
        let output = harness.compile(&sources).expect("compile");

        harness
            .instrument(output.classes_dir(), &implicit())
            .expect("instrument");
        let stdout = harness.run(output.classes_dir(), "demo.Main").expect("run");

        assert_eq!(
            stdout.lines().collect::<Vec<_>>(),
            vec!["Argument 0 for implicit 'NotNull' parameter of demo/Main$Foo.<init> must not be null"]
        );
    }

    #[test]
    fn early_return_in_a_large_method_is_guarded() {
        let Some(harness) = harness() else {
            return;
        };
        let statements = "        hash = hash * 31 + k;\n".repeat(5_000);
        let main = format!(
            r#"
package demo;

import org.jetbrains.annotations.NotNull;

public class Main {{
    @NotNull
    static String big(int k) {{
        if (k == 0) {{
            return null;
        }}
        int hash = 0;
{statements}
        return hash == 7 ? "seven" : "late";
    }}

    public static void main(String[] args) {{
        System.out.println(big(1));
        try {{
            big(0);
        }} catch (IllegalStateException e) {{
            System.out.println(e.getMessage());
        }}
    }}
}}
"#
        );
        let sources = [
            SourceFile::new("org/jetbrains/annotations/NotNull.java", NOT_NULL_SOURCE),
            SourceFile::new("demo/Main.java", &main),
        ];
        let output = harness.compile(&sources).expect("compile");

        let report = harness
            .instrument(output.classes_dir(), &Configuration::default())
            .expect("instrument");
        let stdout = harness.run(output.classes_dir(), "demo.Main").expect("run");

        assert_eq!(report.modified, 1);
        assert_eq!(
            stdout.lines().collect::<Vec<_>>(),
            vec!["late", "NotNull method demo/Main.big must not return null"]
        );
    }
}
