//! Content-addressed builder and artifact names.

use sha2::{Digest, Sha256};

fn digest_name(description: &str) -> String {
    let digest = hex::encode(Sha256::digest(description.as_bytes()));
    format!("builder-{}", &digest[..40])
}

pub fn module_builder_description(runtime: &str, name: &str, builder_version: &str) -> String {
    format!("module-builder:{runtime}:{name}:{builder_version}")
}

pub fn function_builder_description(runtime: &str, builder_version: &str) -> String {
    format!("function-builder:{runtime}:{builder_version}")
}

/// Builder dedicated to one package name on one runtime.
pub fn module_builder_name(runtime: &str, name: &str, builder_version: &str) -> String {
    digest_name(&module_builder_description(runtime, name, builder_version))
}

/// Builder shared by every deployment package build on one runtime.
pub fn function_builder_name(runtime: &str, builder_version: &str) -> String {
    digest_name(&function_builder_description(runtime, builder_version))
}

/// Object store key of a built module.
pub fn module_artifact_key(runtime: &str, name: &str, version: &str) -> String {
    format!("modules/{runtime}/{name}/{version}.tgz")
}

/// Object store key of a deployment package.
pub fn package_key(resource_name: &str, build_id: &str) -> String {
    format!("packages/{resource_name}/{build_id}.zip")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_stable_and_version_scoped() {
        let a = module_builder_name("nodejs18.x", "sharp", "1");
        assert_eq!(a, module_builder_name("nodejs18.x", "sharp", "1"));
        assert_eq!(a.len(), "builder-".len() + 40);
        assert_ne!(a, module_builder_name("nodejs18.x", "sharp", "2"));
        assert_ne!(a, module_builder_name("nodejs16.x", "sharp", "1"));
        assert_ne!(
            function_builder_name("nodejs18.x", "1"),
            function_builder_name("nodejs18.x", "2")
        );
    }

    #[test]
    fn scoped_module_keys() {
        assert_eq!(
            module_artifact_key("nodejs18.x", "@acme/utils", "1.0.0"),
            "modules/nodejs18.x/@acme/utils/1.0.0.tgz"
        );
    }
}
