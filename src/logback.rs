//! Logback configuration handed to the JVM based stage scripts.

use std::{
    fs,
    path::{Path, PathBuf},
};

const LOGBACK_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<configuration>

    <appender name="STDOUT" class="ch.qos.logback.core.ConsoleAppender">
        <!-- reduce the produced standard output in console for clarity, but all debug out is still in the produced log file -->
        <filter class="ch.qos.logback.classic.filter.ThresholdFilter">
            <level>INFO</level>
        </filter>
        <encoder>
            <pattern>%d{HH:mm:ss} %highlight(%-5level) %boldWhite%-20([%.18thread]) %cyan(%-35.35class{35}) %msg%n</pattern>
        </encoder>
    </appender>

    <timestamp key="myTimestamp" datePattern="yyyy-MM-dd'_'HH-mm-ss.SSS"/>
    <appender name="FILE" class="ch.qos.logback.core.FileAppender">
        <encoder class="ch.qos.logback.core.encoder.LayoutWrappingEncoder">
            <layout class="ch.qos.logback.classic.html.HTMLLayout">
                <pattern>%d{HH:mm:ss.SSS}%thread%level%class%msg</pattern>
            </layout>
        </encoder>
        <file><DIR>/<NAME>.html</file>
        <append>true</append>
        <!-- set immediateFlush to false for much higher logging throughput -->
        <immediateFlush>true</immediateFlush>
    </appender>

    <root level="TRACE">
        <appender-ref ref="STDOUT" />
        <appender-ref ref="FILE" />
    </root>

</configuration>
"#;

/// Renders the template so the HTML log lands in `logs_dir/<name>.html`.
pub fn render(logs_dir: &Path, name: &str) -> String {
    LOGBACK_TEMPLATE
        .replace("<DIR>", &logs_dir.to_string_lossy())
        .replace("<NAME>", name)
}

/// Writes `<config_dir>/<name>.xml` and returns its path.
///
/// A failed write is only logged, the stage script then falls back to its
/// own logging setup.
pub fn write_config(config_dir: &Path, logs_dir: &Path, name: &str) -> PathBuf {
    let path = config_dir.join(format!("{}.xml", name));
    if let Err(err) = fs::write(&path, render(logs_dir, name)) {
        log::warn!("Failed to write logback config {:?}: {}", path, err);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn render_substitutes_dir_and_name() {
        let config = render(Path::new("./logs/emulator5554"), "emulator5554-01explore");
        assert!(config.contains("<file>./logs/emulator5554/emulator5554-01explore.html</file>"));
        assert!(!config.contains("<DIR>"));
        assert!(!config.contains("<NAME>"));
        assert!(config.contains("<root level=\"TRACE\">"));
    }

    #[test]
    fn write_config_creates_xml_file() {
        let dir = tempdir().unwrap();
        let path = write_config(dir.path(), Path::new("logs"), "emulator5556-02extract");

        assert_eq!(path, dir.path().join("emulator5556-02extract.xml"));
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("logs/emulator5556-02extract.html"));
    }

    #[test]
    fn write_config_into_missing_dir_still_returns_path() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing");
        let path = write_config(&missing, Path::new("logs"), "x");
        assert_eq!(path, missing.join("x.xml"));
        assert!(!path.exists());
    }
}
