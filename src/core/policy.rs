use crate::config::Permission;
use serde::{Deserialize, Serialize};

pub const POLICY_VERSION: &str = "2012-10-17";

/// Everything the admin user may do on a managed bucket.
pub const ADMIN_ACTIONS: [&str; 38] = [
    "s3:AbortMultipartUpload",
    "s3:CreateBucket",
    "s3:DeleteBucketPolicy",
    "s3:DeleteBucketWebsite",
    "s3:DeleteBucket",
    "s3:DeleteObject",
    "s3:DeleteObjectVersion",
    "s3:GetBucketAcl",
    "s3:GetBucketLogging",
    "s3:GetBucketNotification",
    "s3:GetBucketPolicy",
    "s3:GetBucketTagging",
    "s3:GetBucketVersioning",
    "s3:GetBucketWebsite",
    "s3:GetLifecycleConfiguration",
    "s3:GetObjectAcl",
    "s3:GetObject",
    "s3:GetObjectVersionAcl",
    "s3:GetObjectVersion",
    "s3:GetObjectVersionTorrent",
    "s3:ListAllMyBuckets",
    "s3:ListBucketMultipartUploads",
    "s3:ListBucket",
    "s3:ListBucketVersions",
    "s3:ListMultipartUploadParts",
    "s3:PutBucketAcl",
    "s3:PutBucketLogging",
    "s3:PutBucketNotification",
    "s3:PutBucketPolicy",
    "s3:PutBucketRequestPayment",
    "s3:PutBucketTagging",
    "s3:PutBucketVersioning",
    "s3:PutBucketWebsite",
    "s3:PutLifecycleConfiguration",
    "s3:PutObjectAcl",
    "s3:PutObject",
    "s3:PutObjectVersionAcl",
    "s3:RestoreObject",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    #[serde(rename = "AWS")]
    pub aws: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    pub effect: String,
    pub principal: Principal,
    pub action: Vec<String>,
    pub resource: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BucketPolicy {
    pub version: String,
    pub statement: Vec<Statement>,
}

pub fn user_arn(username: &str) -> String {
    format!("arn:aws:iam:::user/{}", username)
}

fn resources(bucket: &str) -> Vec<String> {
    vec![format!("arn:aws:s3:::{}", bucket), format!("arn:aws:s3:::{}/*", bucket)]
}

fn allow(username: &str, actions: Vec<String>, bucket: &str) -> Statement {
    Statement {
        effect: "Allow".to_string(),
        principal: Principal {
            aws: vec![user_arn(username)],
        },
        action: actions,
        resource: resources(bucket),
    }
}

impl BucketPolicy {
    /// Policy granting only the admin user.
    pub fn admin_only(bucket: &str, admin_username: &str) -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            statement: vec![allow(
                admin_username,
                ADMIN_ACTIONS.iter().map(|a| a.to_string()).collect(),
                bucket,
            )],
        }
    }

    /// Admin statement plus one statement per `(username, permissions)` grant.
    pub fn for_bucket<'a, I>(bucket: &str, admin_username: &str, grants: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [Permission])>,
    {
        let mut policy = Self::admin_only(bucket, admin_username);
        for (username, permissions) in grants {
            let actions = permissions.iter().map(|p| p.s3_action().to_string()).collect();
            policy.statement.push(allow(username, actions, bucket));
        }
        policy
    }

    pub fn to_json(&self) -> crate::utils::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
