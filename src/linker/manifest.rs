//! Side-by-side manifest generation. The linker builds its own manifest XML
//! from the config; when external manifest fragments are supplied it shells
//! out to `mt.exe` to merge them.

use std::process::Command;

use super::config::Config;
use super::session::{DiagKind, Session};

/// The manifest the linker writes when only config-level inputs exist.
pub fn make_linker_manifest(
    uac_level: &str,
    ui_access: bool,
    dependencies: &[String],
) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n");
    xml.push_str(
        "<assembly xmlns=\"urn:schemas-microsoft-com:asm.v1\" manifestVersion=\"1.0\">\n",
    );
    xml.push_str("  <trustInfo xmlns=\"urn:schemas-microsoft-com:asm.v3\">\n");
    xml.push_str("    <security>\n      <requestedPrivileges>\n");
    xml.push_str(&format!(
        "        <requestedExecutionLevel level='{uac_level}' uiAccess='{ui_access}'/>\n",
    ));
    xml.push_str("      </requestedPrivileges>\n    </security>\n  </trustInfo>\n");
    for dependency in dependencies {
        xml.push_str("  <dependency>\n    <dependentAssembly>\n");
        xml.push_str(&format!("      <assemblyIdentity {dependency}/>\n"));
        xml.push_str("    </dependentAssembly>\n  </dependency>\n");
    }
    xml.push_str("</assembly>\n");
    xml
}

/// Produces the final manifest: the linker's own, or the `mt.exe` merge of
/// the linker's with every `/MANIFESTINPUT` fragment.
pub fn manifest_from_inputs(session: &Session, config: &Config) -> Option<String> {
    let own = make_linker_manifest(
        &config.manifest_uac_level,
        config.manifest_ui_access,
        &config.manifest_dependencies,
    );
    if config.input_manifests.is_empty() {
        return Some(own);
    }

    let own_path = std::env::temp_dir().join(format!("solder-manifest-{}.xml", std::process::id()));
    let merged_path =
        std::env::temp_dir().join(format!("solder-manifest-{}-merged.xml", std::process::id()));
    if let Err(io_error) = std::fs::write(&own_path, &own) {
        session.error(
            DiagKind::MtToolFailure,
            format!("unable to stage manifest: {io_error}"),
        );
        return Some(own);
    }

    let mut command = Command::new(&config.mt_path);
    command.arg("-nologo").arg("-manifest").arg(&own_path);
    for input in &config.input_manifests {
        command.arg(input);
    }
    command.arg(format!("-out:{}", merged_path.display()));

    let merged = match command.status() {
        Ok(status) if status.success() => std::fs::read_to_string(&merged_path).ok(),
        Ok(status) => {
            session.error(
                DiagKind::MtToolFailure,
                format!("{} exited with {status}", config.mt_path),
            );
            None
        }
        Err(spawn_error) => {
            session.error(
                DiagKind::MtToolFailure,
                format!("unable to run {}: {spawn_error}", config.mt_path),
            );
            None
        }
    };
    let _ = std::fs::remove_file(&own_path);
    let _ = std::fs::remove_file(&merged_path);
    Some(merged.unwrap_or(own))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_carries_uac_and_dependencies() {
        let xml = make_linker_manifest(
            "requireAdministrator",
            true,
            &["type='win32' name='Common-Controls' version='6.0.0.0'".into()],
        );
        assert!(xml.contains("level='requireAdministrator'"));
        assert!(xml.contains("uiAccess='true'"));
        assert!(xml.contains("name='Common-Controls'"));
        assert!(xml.starts_with("<?xml"));
    }
}
