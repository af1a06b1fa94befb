//! Control-flow guard tables. The builder participates in the pipeline with
//! the same lifecycle as the other synthesized-section builders but is
//! currently disabled: `/GUARD` still pushes the load-config include so the
//! CRT's tables get linked, and the image advertises the guard
//! characteristic, but no `GFIDS`/`EHCont` tables are assembled here.

use log::debug;

use super::config::Config;

pub fn build_guard_tables(config: &Config) -> Option<Vec<u8>> {
    if !(config.guard_cf || config.guard_ehcont || config.guard_longjmp) {
        return None;
    }
    // TODO: assemble the guard function table from the symbols the compiler
    // lists in .gfids$y and patch the load config fields
    debug!("guard tables requested; the builder is disabled");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_without_guard_flags() {
        let config = Config::default();
        assert!(build_guard_tables(&config).is_none());
        let config = Config {
            guard_cf: true,
            ..Default::default()
        };
        assert!(build_guard_tables(&config).is_none());
    }
}
