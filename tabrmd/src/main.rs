// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! tabrmd is a TPM2 access-broker resource manager daemon. See the
//! [tpm2-abrmd](https://github.com/tpm2-software/tpm2-abrmd) project this
//! reimplements for background on what an access broker does.
use clap::Parser;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let args = libtabrmd::Args::parse();

    if args.version() {
        println!("tabrmd {}", VERSION);
        return Ok(());
    }

    libtabrmd::run(args)
}
