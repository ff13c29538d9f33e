//! TLS certificate management.
//!
//! Generates a self-signed CA plus a per-host server certificate signed by
//! it, so users can install one CA and trust every host they run the server
//! on. Files live in the configured ssl directory:
//!
//!   wtty_ca.crt / wtty_ca.key            the CA pair
//!   wtty_<host>.crt / wtty_<host>.key    the server pair for `host`

use std::path::{Path, PathBuf};

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use tracing::info;
use wtty_core::{WttyError, WttyResult};

const CA_CERT: &str = "wtty_ca.crt";
const CA_KEY: &str = "wtty_ca.key";

fn server_cert_name(host: &str) -> String {
    format!("wtty_{host}.crt")
}

fn server_key_name(host: &str) -> String {
    format!("wtty_{host}.key")
}

/// The server certificate/key pair for `host`, if both files exist.
pub fn server_cert_paths(ssl_dir: &Path, host: &str) -> Option<(PathBuf, PathBuf)> {
    let crt = ssl_dir.join(server_cert_name(host));
    let key = ssl_dir.join(server_key_name(host));
    (crt.exists() && key.exists()).then_some((crt, key))
}

/// Generate any missing certificates for `host`. Existing files are kept.
pub fn prepare_certs(ssl_dir: &Path, host: &str) -> WttyResult<()> {
    std::fs::create_dir_all(ssl_dir)?;

    let ca_crt_path = ssl_dir.join(CA_CERT);
    let ca_key_path = ssl_dir.join(CA_KEY);

    let (ca_params, ca_key) = if ca_crt_path.exists() && ca_key_path.exists() {
        info!(path = %ca_crt_path.display(), "using existing CA certificate");
        let ca_pem = std::fs::read_to_string(&ca_crt_path)?;
        let key_pem = std::fs::read_to_string(&ca_key_path)?;
        let params = CertificateParams::from_ca_cert_pem(&ca_pem)
            .map_err(|e| WttyError::Config(format!("cannot parse CA certificate: {e}")))?;
        let key = KeyPair::from_pem(&key_pem)
            .map_err(|e| WttyError::Config(format!("cannot parse CA key: {e}")))?;
        (params, key)
    } else {
        info!("generating CA certificate");
        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, format!("wtty CA on {hostname}"));
        params.distinguished_name.push(DnType::OrganizationName, "wtty");

        let key = KeyPair::generate().map_err(|e| WttyError::Config(e.to_string()))?;
        let cert = params
            .clone()
            .self_signed(&key)
            .map_err(|e| WttyError::Config(e.to_string()))?;

        std::fs::write(&ca_crt_path, cert.pem())?;
        write_private_key(&ca_key_path, &key.serialize_pem())?;
        info!(path = %ca_crt_path.display(), "CA certificate written");
        (params, key)
    };

    let srv_crt_path = ssl_dir.join(server_cert_name(host));
    let srv_key_path = ssl_dir.join(server_key_name(host));
    if srv_crt_path.exists() && srv_key_path.exists() {
        info!(path = %srv_crt_path.display(), "server certificate found");
        return Ok(());
    }

    info!(host, "generating server certificate");
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(|e| WttyError::Config(e.to_string()))?;

    let mut params = CertificateParams::new(vec![host.to_string()])
        .map_err(|e| WttyError::Config(e.to_string()))?;
    params.distinguished_name.push(DnType::CommonName, host);
    params.distinguished_name.push(DnType::OrganizationName, "wtty");

    let key = KeyPair::generate().map_err(|e| WttyError::Config(e.to_string()))?;
    let cert = params
        .signed_by(&key, &ca_cert, &ca_key)
        .map_err(|e| WttyError::Config(e.to_string()))?;

    std::fs::write(&srv_crt_path, cert.pem())?;
    write_private_key(&srv_key_path, &key.serialize_pem())?;
    info!(path = %srv_crt_path.display(), "server certificate written");
    Ok(())
}

/// Write a key file readable by the owner only.
fn write_private_key(path: &Path, pem: &str) -> WttyResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, pem)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_ca_and_server_pair() {
        let dir = tempfile::tempdir().unwrap();
        prepare_certs(dir.path(), "localhost").unwrap();

        assert!(dir.path().join("wtty_ca.crt").exists());
        assert!(dir.path().join("wtty_ca.key").exists());
        let (crt, key) = server_cert_paths(dir.path(), "localhost").expect("server pair");
        assert!(crt.exists() && key.exists());

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn existing_ca_is_reused_for_new_hosts() {
        let dir = tempfile::tempdir().unwrap();
        prepare_certs(dir.path(), "alpha.test").unwrap();
        let ca_before = std::fs::read(dir.path().join("wtty_ca.crt")).unwrap();

        prepare_certs(dir.path(), "beta.test").unwrap();
        let ca_after = std::fs::read(dir.path().join("wtty_ca.crt")).unwrap();

        assert_eq!(ca_before, ca_after, "CA must not be regenerated");
        assert!(server_cert_paths(dir.path(), "alpha.test").is_some());
        assert!(server_cert_paths(dir.path(), "beta.test").is_some());
    }

    #[test]
    fn missing_pair_reports_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(server_cert_paths(dir.path(), "nohost").is_none());
    }
}
