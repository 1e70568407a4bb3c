//! End-to-end coverage of the POSIX verbs against an in-process `Engine`
//! (no kernel mount, no sqlite/redis/network): create, write, read back,
//! list a directory, rename, append, and unlink-while-open. Exercises the
//! same `FsOp` layer `latticefs-fuse`'s `FileSystem` impl dispatches to.

mod support;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use latticefs_core::fsops::{
    Flush, FsOp, GetAttr, Mkdir, Mknod, Open, OpContext, OpReply, Read, ReadDir, Release, Remove, Rename, Write,
};
use latticefs_core::model::ROOT_INODE;

fn ctx<'a>(engine: &'a latticefs_core::Engine, cancel: &'a CancellationToken) -> OpContext<'a> {
    OpContext {
        cache: &engine.cache,
        sync: &engine.sync,
        handles: &engine.handles,
        cancel,
        uid: 0,
        gid: 0,
    }
}

#[tokio::test]
async fn create_write_read_back_round_trips() {
    let (engine, _remote, _dir) = support::test_engine(16).await;
    let cancel = CancellationToken::new();

    let created = Mknod {
        parent_id: ROOT_INODE,
        name: "greeting.txt".into(),
        mode: 0o644,
    }
    .apply(ctx(&engine, &cancel))
    .await
    .unwrap();
    let OpReply::Inode(inode) = created else { panic!("expected Inode reply") };

    let OpReply::Handle(handle) = Open { inode_id: inode.inode_id, flags: libc::O_RDWR as u32 }
        .apply(ctx(&engine, &cancel))
        .await
        .unwrap()
    else {
        panic!("expected Handle reply")
    };

    Write {
        handle_id: handle,
        offset: 0,
        data: Bytes::from_static(b"hello world"),
    }
    .apply(ctx(&engine, &cancel))
    .await
    .unwrap();

    let OpReply::Data(data) = Read { handle_id: handle, offset: 0, length: 11 }.apply(ctx(&engine, &cancel)).await.unwrap() else {
        panic!("expected Data reply")
    };
    assert_eq!(&data[..], b"hello world");

    let OpReply::Inode(attr) = GetAttr { inode_id: inode.inode_id }.apply(ctx(&engine, &cancel)).await.unwrap() else {
        panic!("expected Inode reply")
    };
    assert_eq!(attr.size, 11);

    Release { handle_id: handle }.apply(ctx(&engine, &cancel)).await.unwrap();
}

#[tokio::test]
async fn append_writes_land_at_current_end_of_file() {
    let (engine, _remote, _dir) = support::test_engine(16).await;
    let cancel = CancellationToken::new();

    let created = Mknod { parent_id: ROOT_INODE, name: "log.txt".into(), mode: 0o644 }
        .apply(ctx(&engine, &cancel))
        .await
        .unwrap();
    let OpReply::Inode(inode) = created else { panic!("expected Inode reply") };

    let OpReply::Handle(handle) = Open { inode_id: inode.inode_id, flags: (libc::O_WRONLY | libc::O_APPEND) as u32 }
        .apply(ctx(&engine, &cancel))
        .await
        .unwrap()
    else {
        panic!("expected Handle reply")
    };

    Write { handle_id: handle, offset: 0, data: Bytes::from_static(b"first-") }
        .apply(ctx(&engine, &cancel))
        .await
        .unwrap();
    // Offset is ignored under O_APPEND: both writes must land back to back.
    Write { handle_id: handle, offset: 0, data: Bytes::from_static(b"second") }
        .apply(ctx(&engine, &cancel))
        .await
        .unwrap();

    let OpReply::Inode(attr) = GetAttr { inode_id: inode.inode_id }.apply(ctx(&engine, &cancel)).await.unwrap() else {
        panic!("expected Inode reply")
    };
    assert_eq!(attr.size, 12);

    Release { handle_id: handle }.apply(ctx(&engine, &cancel)).await.unwrap();
}

#[tokio::test]
async fn mkdir_then_readdir_lists_created_children() {
    let (engine, _remote, _dir) = support::test_engine(16).await;
    let cancel = CancellationToken::new();

    for name in ["a.txt", "b.txt"] {
        Mknod { parent_id: ROOT_INODE, name: name.into(), mode: 0o644 }
            .apply(ctx(&engine, &cancel))
            .await
            .unwrap();
    }
    Mkdir { parent_id: ROOT_INODE, name: "sub".into(), mode: 0o755 }
        .apply(ctx(&engine, &cancel))
        .await
        .unwrap();

    let OpReply::Handle(dir_handle) = latticefs_core::fsops::OpenDir { inode_id: ROOT_INODE }
        .apply(ctx(&engine, &cancel))
        .await
        .unwrap()
    else {
        panic!("expected Handle reply")
    };
    let OpReply::DirEntries { entries, .. } = ReadDir { handle_id: dir_handle, cursor: None, batch: 100 }
        .apply(ctx(&engine, &cancel))
        .await
        .unwrap()
    else {
        panic!("expected DirEntries reply")
    };
    let mut names: Vec<_> = entries.iter().map(|(name, _, _)| name.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
}

#[tokio::test]
async fn rename_moves_entry_between_directories() {
    let (engine, _remote, _dir) = support::test_engine(16).await;
    let cancel = CancellationToken::new();

    let OpReply::Inode(dir) = Mkdir { parent_id: ROOT_INODE, name: "dest".into(), mode: 0o755 }
        .apply(ctx(&engine, &cancel))
        .await
        .unwrap()
    else {
        panic!("expected Inode reply")
    };
    Mknod { parent_id: ROOT_INODE, name: "movable.txt".into(), mode: 0o644 }
        .apply(ctx(&engine, &cancel))
        .await
        .unwrap();

    Rename {
        old_parent: ROOT_INODE,
        old_name: "movable.txt".into(),
        new_parent: dir.inode_id,
        new_name: "moved.txt".into(),
    }
    .apply(ctx(&engine, &cancel))
    .await
    .unwrap();

    let OpReply::Inode(moved) = latticefs_core::fsops::Lookup { parent_id: dir.inode_id, name: "moved.txt".into() }
        .apply(ctx(&engine, &cancel))
        .await
        .unwrap()
    else {
        panic!("expected Inode reply")
    };
    assert_eq!(moved.name_in_parent.as_deref(), Some("moved.txt"));

    let gone = latticefs_core::fsops::Lookup { parent_id: ROOT_INODE, name: "movable.txt".into() }
        .apply(ctx(&engine, &cancel))
        .await;
    assert!(matches!(gone, Err(latticefs_core::Error::NotFound)));
}

#[tokio::test]
async fn unlink_while_open_defers_delete_until_release() {
    let (engine, _remote, _dir) = support::test_engine(16).await;
    let cancel = CancellationToken::new();

    let OpReply::Inode(inode) = Mknod { parent_id: ROOT_INODE, name: "ephemeral.txt".into(), mode: 0o644 }
        .apply(ctx(&engine, &cancel))
        .await
        .unwrap()
    else {
        panic!("expected Inode reply")
    };
    let OpReply::Handle(handle) = Open { inode_id: inode.inode_id, flags: libc::O_RDONLY as u32 }
        .apply(ctx(&engine, &cancel))
        .await
        .unwrap()
    else {
        panic!("expected Handle reply")
    };

    Remove { parent_id: ROOT_INODE, name: "ephemeral.txt".into(), expect_dir: false }
        .apply(ctx(&engine, &cancel))
        .await
        .unwrap();

    // Name is gone, but the inode must still be readable through the open handle.
    let looked_up = latticefs_core::fsops::Lookup { parent_id: ROOT_INODE, name: "ephemeral.txt".into() }
        .apply(ctx(&engine, &cancel))
        .await;
    assert!(matches!(looked_up, Err(latticefs_core::Error::NotFound)));
    assert!(engine.cache.inode_store.get(inode.inode_id).await.unwrap().is_some());

    Flush { handle_id: handle }.apply(ctx(&engine, &cancel)).await.unwrap();
    Release { handle_id: handle }.apply(ctx(&engine, &cancel)).await.unwrap();

    assert!(engine.cache.inode_store.get(inode.inode_id).await.unwrap().is_none());
}
