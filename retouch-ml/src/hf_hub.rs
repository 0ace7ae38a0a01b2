pub use retouch_core::download::model as hf_download;

/// Declares a `Manifest` enum of fixed weight files hosted on the Hub.
#[macro_export]
macro_rules! define_models {
    ($($variant:ident => ($repo:literal, $filename:literal)),* $(,)?) => {
        #[derive(Debug, Clone, Copy, strum::EnumIter, strum::EnumProperty)]
        pub enum Manifest {
            $(
                #[strum(props(repo = $repo, filename = $filename))]
                $variant,
            )*
        }

        impl Manifest {
            pub async fn get(&self) -> anyhow::Result<std::path::PathBuf> {
                use strum::EnumProperty;
                use $crate::hf_hub::hf_download;
                let repo = self.get_str("repo").expect("repo property");
                let filename = self.get_str("filename").expect("filename property");
                hf_download(repo, filename).await
            }
        }
    };
}
