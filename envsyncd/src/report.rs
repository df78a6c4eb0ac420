use std::fmt;

use log::kv::Value;
use log::{Level, Log, Record};

const TARGET: &str = "envsyncd::confmap";
const MAP_FIELD: &str = "confmap-update";

/// Structured log records for one synchronization run, written to an
/// injected logger rather than the global one. Every record carries the
/// `confmap-update` field naming the map.
#[derive(Clone, Copy)]
pub(crate) struct SyncLog<'l> {
    logger: &'l dyn Log,
    map_name: &'l str,
}

impl<'l> SyncLog<'l> {
    pub(crate) fn new(logger: &'l dyn Log, map_name: &'l str) -> Self {
        Self { logger, map_name }
    }

    pub(crate) fn emit(&self, level: Level, fields: &[(&str, Value<'_>)], args: fmt::Arguments<'_>) {
        let mut kvs = Vec::with_capacity(fields.len() + 1);
        kvs.push((MAP_FIELD, Value::from(self.map_name)));
        kvs.extend(fields.iter().cloned());
        let kvs: &[(&str, Value<'_>)] = &kvs;

        self.logger.log(
            &Record::builder()
                .level(level)
                .target(TARGET)
                .args(args)
                .key_values(&kvs)
                .build(),
        );
    }

    /// Warning carrying the error that caused it.
    pub(crate) fn warn_error(&self, err: &dyn fmt::Display, what: &str) {
        let err = err.to_string();
        self.emit(
            Level::Warn,
            &[("error", Value::from(err.as_str()))],
            format_args!("{what}"),
        );
    }

    /// Warning naming the capability that stays off.
    pub(crate) fn warn_degraded(&self, what: &str) {
        self.emit(
            Level::Warn,
            &[],
            format_args!("{what}, advanced Cgroups tracking will be disabled"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::CaptureLog;

    #[test]
    fn records_name_the_map_under_one_target() {
        let log = CaptureLog::default();
        let sync_log = SyncLog::new(&log, "tg_conf_map");
        sync_log.warn_error(&"map not pinned", "Failed to open conf map");
        sync_log.warn_degraded("Opening conf map failed");

        let warnings = log.warnings();
        assert_eq!(warnings.len(), 2);
        for record in &warnings {
            assert_eq!(record.target, TARGET);
            assert_eq!(record.module_path, None);
            assert_eq!(record.field(MAP_FIELD), Some("tg_conf_map"));
        }
        assert_eq!(warnings[0].field("error"), Some("map not pinned"));
        assert_eq!(
            warnings[1].message,
            "Opening conf map failed, advanced Cgroups tracking will be disabled"
        );
    }
}
