//! 共享访问凭据
//!
//! 凭据文件 `secure/.credentials` 的格式为 `nonce(24 字节) || 密文`，
//! 明文是 `{"username": .., "password": ..}` 的 JSON。

use anyhow::{anyhow, Context};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const NONCE_SIZE: usize = 24;
const KEY_CONTEXT: &str = "shareupdater 2024-05 credential store v1";
const CREDENTIALS_FILE: &str = ".credentials";

/// 用户名和密码
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// 日志中不输出密码
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// 凭据来源
pub trait CredentialStore: Send + Sync {
    /// 读取凭据；没有或无法读取时返回 None
    fn load_credentials(&self) -> Option<Credentials>;
}

/// 固定凭据
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(pub Option<Credentials>);

impl CredentialStore for StaticCredentials {
    fn load_credentials(&self) -> Option<Credentials> {
        self.0.clone()
    }
}

/// 加密文件存储
pub struct EncryptedFileStore {
    path: PathBuf,
    key: [u8; 32],
}

impl EncryptedFileStore {
    /// 在 `secure_dir` 下存储，密钥由本机主机名派生
    pub fn new(secure_dir: &Path) -> Self {
        let host = sysinfo::System::host_name().unwrap_or_default();
        Self::with_key(secure_dir, blake3::derive_key(KEY_CONTEXT, host.as_bytes()))
    }

    pub fn with_key(secure_dir: &Path, key: [u8; 32]) -> Self {
        Self {
            path: secure_dir.join(CREDENTIALS_FILE),
            key,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.key))
    }

    /// 加密并原子写入
    pub fn save_credentials(&self, credentials: &Credentials) -> anyhow::Result<()> {
        let plaintext = serde_json::to_vec(credentials)?;

        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce).map_err(|e| anyhow!("生成随机数失败: {}", e))?;

        let ciphertext = self
            .cipher()
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| anyhow!("加密凭据失败"))?;

        let mut content = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        content.extend_from_slice(&nonce);
        content.extend_from_slice(&ciphertext);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("创建目录失败: {}", parent.display()))?;
        }

        let temp = self.path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&temp, &content).with_context(|| format!("写入失败: {}", temp.display()))?;
        if let Err(e) = fs::rename(&temp, &self.path) {
            let _ = fs::remove_file(&temp);
            return Err(e).with_context(|| format!("替换失败: {}", self.path.display()));
        }

        debug!("凭据已保存: {}", self.path.display());
        Ok(())
    }

    fn read(&self) -> anyhow::Result<Credentials> {
        let content =
            fs::read(&self.path).with_context(|| format!("读取失败: {}", self.path.display()))?;
        if content.len() <= NONCE_SIZE {
            return Err(anyhow!("凭据文件已损坏"));
        }

        let (nonce, ciphertext) = content.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher()
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("解密失败（文件损坏或来自其它机器）"))?;

        Ok(serde_json::from_slice(&plaintext)?)
    }
}

impl CredentialStore for EncryptedFileStore {
    fn load_credentials(&self) -> Option<Credentials> {
        if !self.path.exists() {
            debug!("凭据文件不存在: {}", self.path.display());
            return None;
        }

        match self.read() {
            Ok(credentials) => Some(credentials),
            Err(e) => {
                warn!("无法读取凭据: {:#}", e);
                None
            }
        }
    }
}
