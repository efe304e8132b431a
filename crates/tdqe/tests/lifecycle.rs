// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

use p256::ecdsa::{signature::Verifier as _, Signature};
use sha2::{Digest, Sha256};
use std::{
    sync::{Arc, Barrier},
    time::Duration,
};
use tdqe::{
    config::QuotingConfig,
    coordinator::CertificationDecision,
    ecc::{self, PublicKeyLe, SignatureLe},
    error::QuoteError,
    hardware::LoadError,
    provider::{QeCertConfig, StaticCertProvider},
    qe::{
        assemble::quote_size_for,
        blob::{self, RecordPlain},
        keygen::key_fingerprint,
        CertKeyType, QeReportRequest, QeStatus, QuotingEnclave,
    },
    quote::{CertDataType, Quote, SIGNATURE_OFFSET, SIGNED_REGION_LEN},
    quoting::QuotingContext,
    report::ReportBody,
    sim::SimPlatform,
    storage::{MemoryStorage, PersistentStorage},
    tcb::CertTcb,
};
use tracing_test::traced_test;

const LABEL: &str = "tdqe_data.blob";

struct Fixture {
    platform: SimPlatform,
    provider: Arc<StaticCertProvider>,
    storage: Arc<MemoryStorage>,
    ctx: QuotingContext,
}

fn pck_chain(len: usize) -> Vec<u8> {
    let mut chain = b"-----BEGIN CERTIFICATE-----\n".to_vec();
    chain.resize(len, b'A');
    chain
}

fn cert_config(platform: &SimPlatform, pce_isv_svn: u16) -> QeCertConfig {
    QeCertConfig {
        cert_cpu_svn: platform.cpu_svn(),
        cert_pce_isv_svn: pce_isv_svn,
        cert_data: pck_chain(1500),
    }
}

fn context(platform: &SimPlatform, config: QuotingConfig) -> QuotingContext {
    QuotingContext::new(
        config,
        Arc::new(platform.qe_loader()),
        Arc::new(platform.pce_loader()),
    )
}

// Simulated platform with raw PCE SVN 13 and a provider holding a certificate
// for `cert_pce_isv_svn`, or nothing.
fn fixture(cert_pce_isv_svn: Option<u16>) -> Fixture {
    let platform = SimPlatform::default();
    let provider = Arc::new(StaticCertProvider::default());
    provider.set(cert_pce_isv_svn.map(|svn| cert_config(&platform, svn)));
    let storage = Arc::new(MemoryStorage::default());
    let ctx = context(&platform, QuotingConfig::default())
        .with_provider(provider.clone())
        .with_storage(storage.clone());
    Fixture {
        platform,
        provider,
        storage,
        ctx,
    }
}

fn quote(f: &Fixture) -> Vec<u8> {
    let size = f.ctx.get_quote_size().unwrap();
    let mut buf = vec![0u8; size];
    let out = f
        .ctx
        .get_quote(&f.platform.td_report([0x42; 64]), &mut buf, None)
        .unwrap();
    assert_eq!(out.len, size);
    buf
}

fn stored_record(f: &Fixture) -> RecordPlain {
    let blob = f.storage.read(LABEL).unwrap();
    blob::unseal(&f.platform.qe_hardware(), &blob, &f.platform.qe_seal_tcb())
        .unwrap()
        .plain
}

#[test]
#[traced_test]
fn test_scenario_a_first_init_generates_key() {
    let f = fixture(None);
    let out = f.ctx.init_quote(false).unwrap();
    assert_eq!(out.decision, CertificationDecision::RegenerateAndCertify);
    assert!(logs_contain("Deciding"));
    assert!(logs_contain("Regenerating"));
    assert!(logs_contain("Sealing"));

    let bytes = quote(&f);
    let parsed = Quote::parse(&bytes).unwrap();
    let auth_data = QuotingConfig::default().auth_data;
    let public_key = parsed.signature_data.ecdsa_attestation_key;
    assert_eq!(out.key_fingerprint, key_fingerprint(&public_key, &auth_data));
    assert_eq!(
        parsed.signature_data.qe_report_data.qe_auth_data.data,
        auth_data.to_vec()
    );

    // the QE report commits to the key and carries the certifier's signature
    let qe_report: ReportBody = bytemuck::cast(parsed.signature_data.qe_report_data.qe_report);
    assert_eq!(&qe_report.report_data[..32], &out.key_fingerprint);
    let payload = parsed.ppid_payload().unwrap();
    assert_eq!(payload.encrypted_ppid, f.platform.encrypted_ppid());
    let cert_tcb = CertTcb {
        cpu_svn: payload.cpu_svn,
        pce_isv_svn: { payload.pce_isv_svn },
        pce_id: { payload.pce_id },
    };
    assert_eq!(cert_tcb, f.platform.raw_tcb());
    let pck = f.platform.pck_verifying_key(&cert_tcb).unwrap();
    let qe_report_signature =
        Signature::from_slice(&parsed.signature_data.qe_report_data.qe_report_signature).unwrap();
    assert!(pck
        .verify(bytemuck::bytes_of(&qe_report), &qe_report_signature)
        .is_ok());

    // the quote verifies with the attestation key
    assert!(ecc::verify(
        &PublicKeyLe::from_wire(&public_key),
        &parsed.signed_region(),
        &SignatureLe::from_wire(&parsed.signature_data.ecdsa_signature),
    )
    .unwrap());
    assert_eq!(parsed.report.report_data, [0x42; 64]);

    assert!(f.storage.read(LABEL).is_ok());
}

#[test]
fn test_scenario_b_matching_provider_tcb_reuses_key() {
    let f = fixture(Some(12));
    let first = f.ctx.init_quote(false).unwrap();
    assert_eq!(first.decision, CertificationDecision::RegenerateAndCertify);
    assert_eq!({ stored_record(&f).cert_pce_isv_svn }, 12);

    let second = f.ctx.init_quote(false).unwrap();
    assert_eq!(second.decision, CertificationDecision::ReuseAsIs);
    assert_eq!(second.key_fingerprint, first.key_fingerprint);
    assert_eq!(stored_record(&f).key_fingerprint, first.key_fingerprint);
    assert_eq!(f.ctx.regenerations(), 1);
    assert_eq!(f.platform.stats().certifications, 1);
}

#[test]
fn test_scenario_c_bumped_pce_svn_recertifies() {
    let f = fixture(Some(12));
    let first = f.ctx.init_quote(false).unwrap();
    let before = stored_record(&f);

    f.provider.set(Some(cert_config(&f.platform, 13)));
    let mut buf = vec![0u8; f.ctx.get_quote_size().unwrap()];
    assert!(matches!(
        f.ctx
            .get_quote(&f.platform.td_report([0; 64]), &mut buf, None),
        Err(QuoteError::KeyNotInitialized(_))
    ));

    let out = f.ctx.init_quote(false).unwrap();
    let expected = CertTcb {
        pce_isv_svn: 13,
        ..before.cert_tcb()
    };
    assert_eq!(
        out.decision,
        CertificationDecision::RecertifyOnly { cert_tcb: expected }
    );
    assert_eq!(out.key_fingerprint, first.key_fingerprint);

    let after = stored_record(&f);
    assert_eq!(after.public_key, before.public_key);
    assert_eq!(after.cert_tcb(), expected);
    assert_eq!(f.ctx.regenerations(), 1);

    let parsed = Quote::parse(&quote(&f)).unwrap();
    let cert = parsed.certification_data();
    assert_eq!(cert.cert_type, CertDataType::PckCertChain as u16);
    assert_eq!(cert.body.data, pck_chain(1500));
    assert_eq!({ parsed.header.pce_svn }, 13);
}

#[test]
fn test_newer_provider_tcb_never_reuses() {
    let f = fixture(Some(12));
    f.ctx.init_quote(false).unwrap();

    f.platform.set_cpu_svn([2; 16]);
    f.provider.set(Some(cert_config(&f.platform, 12)));
    let out = f.ctx.init_quote(false).unwrap();
    assert_ne!(out.decision, CertificationDecision::ReuseAsIs);
    assert_eq!(stored_record(&f).cert_cpu_svn, [2; 16]);

    // a certifier update means a reload
    f.ctx.teardown();
    f.platform.set_pce_isv_svn(14);
    f.provider.set(Some(cert_config(&f.platform, 14)));
    let out = f.ctx.init_quote(false).unwrap();
    assert_ne!(out.decision, CertificationDecision::ReuseAsIs);
    assert_eq!({ stored_record(&f).cert_pce_isv_svn }, 14);
}

#[test]
fn test_without_provider_raw_tcb_drives_recertification() {
    let platform = SimPlatform::default();
    let ctx = context(&platform, QuotingConfig::default());
    ctx.init_quote(false).unwrap();
    assert_eq!(
        ctx.init_quote(false).unwrap().decision,
        CertificationDecision::ReuseAsIs
    );

    ctx.teardown();
    platform.set_pce_isv_svn(14);
    let out = ctx.init_quote(false).unwrap();
    assert_eq!(
        out.decision,
        CertificationDecision::RecertifyOnly {
            cert_tcb: platform.raw_tcb()
        }
    );

    let mut buf = vec![0u8; ctx.get_quote_size().unwrap()];
    let len = ctx
        .get_quote(&platform.td_report([0; 64]), &mut buf, None)
        .unwrap()
        .len;
    let payload = Quote::parse(&buf[..len]).unwrap().ppid_payload().unwrap();
    assert_eq!({ payload.pce_isv_svn }, 14);
}

#[test]
fn test_stale_certification_without_provider_answer_recertifies() {
    let f = fixture(Some(12));
    let first = f.ctx.init_quote(false).unwrap();
    let before = stored_record(&f);
    assert_eq!({ before.cert_pce_isv_svn }, 12);
    assert_eq!(before.raw_tcb(), f.platform.raw_tcb());

    // the provider stops answering, the raw TCB is unchanged
    f.provider.set(None);
    let out = f.ctx.init_quote(false).unwrap();
    assert_eq!(
        out.decision,
        CertificationDecision::RecertifyOnly {
            cert_tcb: f.platform.raw_tcb()
        }
    );
    assert_eq!(out.key_fingerprint, first.key_fingerprint);
    assert_eq!({ stored_record(&f).cert_pce_isv_svn }, 13);
    assert_eq!(
        f.ctx.init_quote(false).unwrap().decision,
        CertificationDecision::ReuseAsIs
    );

    let payload = Quote::parse(&quote(&f)).unwrap().ppid_payload().unwrap();
    assert_eq!({ payload.pce_isv_svn }, 13);
}

#[test]
fn test_cpu_svn_change_regenerates_key() {
    let f = fixture(None);
    let first = f.ctx.init_quote(false).unwrap();

    f.platform.set_cpu_svn([2; 16]);
    let out = f.ctx.init_quote(false).unwrap();
    assert_eq!(out.decision, CertificationDecision::RegenerateAndCertify);
    assert_ne!(out.key_fingerprint, first.key_fingerprint);
    assert_eq!(f.ctx.regenerations(), 2);

    let record = stored_record(&f);
    assert_eq!(record.raw_cpu_svn, [2; 16]);
    assert_eq!(record.cert_cpu_svn, [2; 16]);
    assert_eq!(
        f.ctx.init_quote(false).unwrap().decision,
        CertificationDecision::ReuseAsIs
    );
}

#[test]
fn test_scenario_d_short_buffer_writes_nothing() {
    let f = fixture(Some(12));
    f.ctx.init_quote(false).unwrap();
    let size = f.ctx.get_quote_size().unwrap();

    let mut buf = vec![0u8; size - 1];
    assert!(matches!(
        f.ctx
            .get_quote(&f.platform.td_report([1; 64]), &mut buf, None),
        Err(QuoteError::InvalidParameter(_))
    ));
    assert!(buf.iter().all(|b| *b == 0));
}

#[test]
fn test_size_matches_quote() {
    let f = fixture(None);
    f.ctx.init_quote(false).unwrap();
    assert_eq!(f.ctx.get_quote_size().unwrap(), quote_size_for(None));
    assert_eq!(quote(&f).len(), quote_size_for(None));

    f.provider.set(Some(cert_config(&f.platform, 13)));
    f.ctx.init_quote(false).unwrap();
    let chain = pck_chain(1500);
    assert_eq!(f.ctx.get_quote_size().unwrap(), quote_size_for(Some(&chain)));
    assert_eq!(quote(&f).len(), quote_size_for(Some(&chain)));
}

#[test]
fn test_scenario_e_concurrent_refresh_regenerates_once() {
    let f = fixture(None);
    f.platform
        .set_certifier_latency(Duration::from_millis(50));
    let barrier = Barrier::new(2);

    let (a, b) = std::thread::scope(|s| {
        let a = s.spawn(|| {
            barrier.wait();
            f.ctx.init_quote(true)
        });
        let b = s.spawn(|| {
            barrier.wait();
            f.ctx.init_quote(true)
        });
        (a.join().unwrap(), b.join().unwrap())
    });
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.key_fingerprint, b.key_fingerprint);
    assert_eq!(f.ctx.regenerations(), 1);
    assert_eq!(f.platform.stats().certifications, 1);
    let regenerated = [a.decision, b.decision]
        .iter()
        .filter(|d| **d == CertificationDecision::RegenerateAndCertify)
        .count();
    assert_eq!(regenerated, 1);

    // a later refresh is not coalesced
    f.ctx.init_quote(true).unwrap();
    assert_eq!(f.ctx.regenerations(), 2);
}

#[test]
fn test_unverifiable_signature_is_never_returned() {
    let platform = SimPlatform::default();
    let qe = QuotingEnclave::new(Arc::new(platform.qe_hardware()));
    let hw = platform.qe_hardware();
    let good = platform.certified_blob(&qe).unwrap();

    // swap in a private key that does not match the sealed public key
    let unsealed = blob::unseal(&hw, &good, &platform.qe_seal_tcb()).unwrap();
    let mut secret = *unsealed.secret;
    let mut private = secret.private_key;
    private[0] ^= 1;
    secret.private_key = private;
    let corrupted = blob::seal(&hw, &unsealed.plain, &secret).unwrap();

    let mut buf = vec![0u8; quote_size_for(None)];
    assert_eq!(
        qe.gen_quote(&corrupted, &platform.td_report([3; 64]), None, None, &mut buf)
            .err(),
        Some(QeStatus::CryptoError)
    );
    let invalid = ecc::sign(&private, &buf[..SIGNED_REGION_LEN])
        .unwrap()
        .to_wire();
    let written = &buf[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 64];
    assert_ne!(written, &invalid[..]);
    assert_ne!(written, &[0u8; 64][..]);
}

#[test]
fn test_companion_report_binds_nonce_and_quote() {
    let f = fixture(Some(13));
    f.ctx.init_quote(false).unwrap();
    let request = QeReportRequest {
        nonce: [0xab; 16],
        target_info: f.platform.requester_target_info(),
    };
    let mut buf = vec![0u8; f.ctx.get_quote_size().unwrap()];
    let out = f
        .ctx
        .get_quote(&f.platform.td_report([5; 64]), &mut buf, Some(&request))
        .unwrap();
    let report = out.qe_report.unwrap();
    f.platform.verify_report_for_requester(&report).unwrap();

    let expected = Sha256::new()
        .chain_update(request.nonce)
        .chain_update(&buf[..out.len])
        .finalize();
    assert_eq!(&report.body.report_data[..32], &expected[..]);
}

#[test]
fn test_lost_boundary_is_retried_once() {
    let f = fixture(None);
    f.ctx.init_quote(false).unwrap();
    assert_eq!(f.platform.stats().qe_loads, 1);

    f.platform.inject_boundary_loss(1);
    quote(&f);
    assert_eq!(f.platform.stats().qe_loads, 2);

    f.platform.inject_boundary_loss(2);
    let err = f.ctx.get_quote_size().unwrap_err();
    assert!(err.is_boundary_lost());
    assert!(f.ctx.get_quote_size().is_ok());
}

#[test]
fn test_load_failure_is_reported() {
    let f = fixture(None);
    f.platform.fail_next_load(LoadError::FileAccess);
    assert!(matches!(
        f.ctx.init_quote(false),
        Err(QuoteError::BoundaryUnavailable { lost: false, .. })
    ));
    assert!(f.ctx.init_quote(false).is_ok());
}

#[test]
#[traced_test]
fn test_persistence_failure_is_a_warning() {
    let f = fixture(None);
    f.storage.fail_writes(true);
    let out = f.ctx.init_quote(false).unwrap();
    assert!(logs_contain("Failed to persist attestation key blob"));
    assert!(f.storage.read(LABEL).is_err());

    // the in-memory blob stays authoritative
    assert!(f.ctx.get_quote_size().is_ok());
    let again = f.ctx.init_quote(false).unwrap();
    assert_eq!(again.decision, CertificationDecision::ReuseAsIs);
    assert_eq!(again.key_fingerprint, out.key_fingerprint);
}

#[test]
#[traced_test]
fn test_corrupted_blob_is_regenerated() {
    let f = fixture(None);
    f.storage.write(LABEL, &[0x5a; 100]).unwrap();
    assert!(matches!(
        f.ctx.get_quote_size(),
        Err(QuoteError::KeyNotInitialized(_))
    ));

    let out = f.ctx.init_quote(false).unwrap();
    assert_eq!(out.decision, CertificationDecision::RegenerateAndCertify);
    assert!(logs_contain("unusable"));
    assert_eq!(stored_record(&f).key_fingerprint, out.key_fingerprint);
}

#[test]
fn test_fingerprint_survives_reseal() {
    let f = fixture(None);
    let out = f.ctx.init_quote(false).unwrap();
    let auth_data = QuotingConfig::default().auth_data;

    f.platform.set_cpu_svn([2; 16]);
    f.ctx.get_quote_size().unwrap();
    let record = stored_record(&f);
    assert_eq!({ record.seal_cpu_svn }, [2; 16]);
    assert_eq!(record.key_fingerprint, out.key_fingerprint);
    assert_eq!(
        record.key_fingerprint,
        key_fingerprint(&{ record.public_key }, &auth_data)
    );
}

#[test]
fn test_unsupported_key_kind() {
    let platform = SimPlatform::default();
    let config = QuotingConfig {
        cert_key_type: CertKeyType::PpidCleartext,
        ..Default::default()
    };
    let ctx = context(&platform, config);
    assert!(matches!(
        ctx.init_quote(false),
        Err(QuoteError::UnsupportedKeyKind(_))
    ));
}

#[test]
fn test_out_of_range_certification_data() {
    let f = fixture(None);
    f.provider.set(Some(QeCertConfig {
        cert_data: pck_chain(100),
        ..cert_config(&f.platform, 13)
    }));
    assert!(matches!(
        f.ctx.init_quote(false),
        Err(QuoteError::CertificationDataInvalid(_))
    ));
}
