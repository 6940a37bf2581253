//! 认证会话
//!
//! 登录与令牌刷新由外部负责，同步引擎只读取当前用户。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::RwLock;

/// 已登录用户
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSession {
    pub uid: String,
    pub id_token: String,
}

impl UserSession {
    pub fn new(uid: impl Into<String>, id_token: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            id_token: id_token.into(),
        }
    }
}

impl fmt::Debug for UserSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSession")
            .field("uid", &self.uid)
            .field("id_token", &"<redacted>")
            .finish()
    }
}

/// 当前会话来源
pub trait SessionProvider: Send + Sync {
    /// 未登录时返回 None
    fn current_user(&self) -> Option<UserSession>;
}

/// 固定会话（来自配置或由宿主进程注入）
#[derive(Default)]
pub struct StaticSession {
    user: RwLock<Option<UserSession>>,
}

impl StaticSession {
    pub fn new(user: Option<UserSession>) -> Self {
        Self {
            user: RwLock::new(user),
        }
    }

    pub fn signed_in(uid: impl Into<String>, id_token: impl Into<String>) -> Self {
        Self::new(Some(UserSession::new(uid, id_token)))
    }

    /// 替换会话（例如令牌刷新后）
    pub fn set_user(&self, user: Option<UserSession>) {
        *self.user.write().unwrap_or_else(|p| p.into_inner()) = user;
    }
}

impl SessionProvider for StaticSession {
    fn current_user(&self) -> Option<UserSession> {
        self.user.read().unwrap_or_else(|p| p.into_inner()).clone()
    }
}
