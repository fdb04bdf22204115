// SPDX-License-Identifier: Apache-2.0

use crate::agent::BoxError;
use rustls::crypto::CryptoProvider;

/// Installs the process-wide rustls provider unless one is already set.
pub fn init_crypto_provider() -> Result<(), BoxError> {
    if CryptoProvider::get_default().is_none() {
        return match rustls::crypto::ring::default_provider().install_default() {
            Ok(_) => Ok(()),
            // Lost a race with another caller
            Err(_) if CryptoProvider::get_default().is_some() => Ok(()),
            Err(e) => Err(format!("failed to initialize crypto library: {:?}", e).into()),
        };
    }
    Ok(())
}
