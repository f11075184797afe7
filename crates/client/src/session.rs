//! # 署名セッション
//!
//! ブートストラップで確立される片方向セッションの状態。
//! 鍵はすべてエフェメラルで、プロセス終了とともに失われる。

use ed25519_dalek::SigningKey as Ed25519SigningKey;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use accord_crypto::{ed25519_sign, AeadSession};

fn b64(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// エフェメラル鍵と確立済みセッション情報の入れ物。
///
/// 生成直後は未確立（トークンなし、AEAD鍵なし）。ハンドシェイク成功時に
/// [`SigningSession::establish`] で一度だけ状態が書き換わる。
pub struct SigningSession {
    signing_key: Ed25519SigningKey,
    encryption_secret: X25519StaticSecret,
    session_token: Option<String>,
    aead: Option<AeadSession>,
}

impl SigningSession {
    /// 新しいエフェメラル鍵ペア一式を生成する。
    pub fn generate() -> Self {
        Self {
            signing_key: Ed25519SigningKey::generate(&mut OsRng),
            encryption_secret: X25519StaticSecret::random_from_rng(OsRng),
            session_token: None,
            aead: None,
        }
    }

    /// Base64エンコードされたEd25519署名用公開鍵。
    pub fn public_key_b64(&self) -> String {
        b64(self.signing_key.verifying_key().as_bytes())
    }

    /// Base64エンコードされたX25519暗号化用公開鍵。
    pub fn encryption_public_key_b64(&self) -> String {
        b64(X25519PublicKey::from(&self.encryption_secret).as_bytes())
    }

    /// 鍵導出に使うX25519秘密鍵への参照。
    pub(crate) fn encryption_secret(&self) -> &X25519StaticSecret {
        &self.encryption_secret
    }

    /// ハンドシェイク成功時にトークンと（あれば）AEADセッションを取り付ける。
    pub fn establish(&mut self, session_token: String, aead: Option<AeadSession>) {
        self.session_token = Some(session_token);
        self.aead = aead;
    }

    /// セッションが確立済みか。
    pub fn is_established(&self) -> bool {
        self.session_token.is_some()
    }

    /// セッショントークン。未確立なら空文字列。
    pub fn token(&self) -> &str {
        self.session_token.as_deref().unwrap_or("")
    }

    /// 本文暗号化用のAEADセッション（ピアが暗号化をサポートする場合のみ）。
    pub fn aead(&self) -> Option<&AeadSession> {
        self.aead.as_ref()
    }

    /// メッセージを署名し、Base64エンコードした署名を返す。
    pub fn sign_b64(&self, message: &[u8]) -> String {
        b64(&ed25519_sign(&self.signing_key, message).to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_crypto::{ed25519_verify, Ed25519Signature, Ed25519VerifyingKey};
    use base64::Engine;

    #[test]
    fn test_fresh_session_is_unestablished() {
        let session = SigningSession::generate();
        assert!(!session.is_established());
        assert_eq!(session.token(), "");
        assert!(session.aead().is_none());
    }

    #[test]
    fn test_establish_attaches_token() {
        let mut session = SigningSession::generate();
        session.establish("tok-1".to_string(), None);
        assert!(session.is_established());
        assert_eq!(session.token(), "tok-1");
    }

    #[test]
    fn test_signature_verifies_against_published_key() {
        let session = SigningSession::generate();
        let engine = base64::engine::general_purpose::STANDARD;

        let key_bytes: [u8; 32] = engine
            .decode(session.public_key_b64())
            .unwrap()
            .try_into()
            .unwrap();
        let verifying_key = Ed25519VerifyingKey::from_bytes(&key_bytes).unwrap();

        let sig_bytes: [u8; 64] = engine
            .decode(session.sign_b64(b"POST\n/echo\nabc\n1\nn\nt"))
            .unwrap()
            .try_into()
            .unwrap();
        let signature = Ed25519Signature::from_bytes(&sig_bytes);
        assert!(ed25519_verify(&verifying_key, b"POST\n/echo\nabc\n1\nn\nt", &signature).is_ok());
    }
}
